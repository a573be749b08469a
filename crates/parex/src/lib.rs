//! parex: speculative, conflict-aware parallel transaction execution.
//!
//! Executes a batch of ordered transactions on multiple worker threads while
//! preserving the exact outcome of a strictly sequential run in original
//! index order:
//!
//! 1. Workers execute transactions in parallel speculatively
//! 2. Every fine-grained state access is declared to a conflict tracker
//! 3. On overlap, the higher-index task is signalled to abort
//! 4. Aborted tasks are reset and re-executed from scratch
//! 5. Results are committed strictly in transaction order
//!
//! # Architecture
//!
//! - [`types`]: Core types (task index, state keys, per-transaction results)
//! - [`task`]: Per-transaction execution context, lifecycle and abort protocol
//! - [`context`]: Abort cell polled at cooperative checkpoints
//! - [`conflict`]: Concurrent key-ownership table and conflict resolution
//! - [`reentrant`]: Per-attempt cache of loaded contract instances
//! - [`state`]: Transactional state view over a base store
//! - [`executor`]: Worker pool, retry policy and in-order commit
//! - [`host`]: Host API boundary seen by executed contract code
//! - [`abi`]: Method-signature encoding for contract metadata exchange

pub mod abi;
pub mod conflict;
pub mod context;
pub mod executor;
pub mod host;
pub mod reentrant;
pub mod state;
pub mod task;
pub mod types;

#[cfg(test)]
mod parallel_tests;

// Re-export commonly used types
pub use conflict::{Access, ConflictTracker};
pub use context::{ExecutionAborted, ExecutionContext};
pub use executor::{
    AttemptEnv, BatchError, ExecutableTransaction, ExecutionError, ExecutorConfig,
    ParallelExecutor,
};
pub use host::{BlockInfo, HostApi, HostError, TransactionInfo};
pub use reentrant::{ContractInstance, ReentrantStack};
pub use state::{InMemoryStore, StateStore, TaskView, ViewError};
pub use task::{CallError, CommittedAttempt, Fault, Task, DEFAULT_MAX_CALL_DEPTH};
pub use types::{
    AttemptNumber, LogEntry, StateKey, StateValue, TaskStatus, TransactionResult,
    TransactionStatus, TxnIndex,
};
