//! Core types for the parallel transaction execution coordinator.
//!
//! This module defines the fundamental types used throughout the crate:
//! - Transaction indexing and attempt counting
//! - Fine-grained state key abstraction used for conflict detection
//! - Per-transaction results exposed to the caller of a batch

use alloy_primitives::{Address, Bytes, U256};
use derive_more::Display;
use std::fmt;

/// Index of a transaction within a batch (0-based).
///
/// The index is the position in the intended serial commit order and is the
/// unique total-order key between tasks: the lower the index, the earlier the
/// transaction sits in serial order and the higher its priority under
/// contention.
pub type TxnIndex = u32;

/// Attempt number - incremented each time a task is reset and re-executed.
/// Starts at 0 for the first attempt.
pub type AttemptNumber = u32;

/// Lifecycle state of a task.
///
/// `Created → Bound → Running → {Committed | Aborted}`, with
/// `Aborted → Created` on reset (retry loop). `Committed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Bound,
    Running,
    Aborted,
    Committed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "Created"),
            TaskStatus::Bound => write!(f, "Bound"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Aborted => write!(f, "Aborted"),
            TaskStatus::Committed => write!(f, "Committed"),
        }
    }
}

/// A fine-grained key into the shared state store.
///
/// Conflict granularity is the full key, not the owning address: two tasks
/// touching disjoint sub-keys under the same address do not conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    /// Account balance: key is the address
    Balance(Address),
    /// Storage entry: key is (address, sub-key)
    Storage(Address, Bytes),
}

impl StateKey {
    /// The resource address this key belongs to.
    pub fn address(&self) -> Address {
        match self {
            StateKey::Balance(addr) => *addr,
            StateKey::Storage(addr, _) => *addr,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Balance(addr) => write!(f, "Balance({})", addr),
            StateKey::Storage(addr, key) => write!(f, "Storage({}, {})", addr, key),
        }
    }
}

/// A value in the shared state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum StateValue {
    /// Balance value
    Balance(U256),
    /// Raw storage entry
    Storage(Bytes),
}

impl StateValue {
    pub fn as_balance(&self) -> Option<U256> {
        match self {
            StateValue::Balance(v) => Some(*v),
            StateValue::Storage(_) => None,
        }
    }

    pub fn as_storage(&self) -> Option<&Bytes> {
        match self {
            StateValue::Storage(v) => Some(v),
            StateValue::Balance(_) => None,
        }
    }
}

/// An event log entry emitted by executed code during an attempt.
///
/// Logs are attempt-scoped: they are discarded with the rest of the attempt
/// state when the task is aborted and surface in the transaction result only
/// when the attempt commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Address of the contract that emitted the log
    pub address: Address,
    /// Indexed topics
    pub indexed: Vec<Bytes>,
    /// Non-indexed payload
    pub data: Vec<Bytes>,
}

/// Final status of a committed transaction.
///
/// A contract-initiated revert is a normal outcome at the batch level: the
/// transaction failed its business logic, the batch still succeeds.
/// Conflict-aborts never appear here - they are resolved internally by retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    Reverted { code: u32, message: Option<String> },
}

impl TransactionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionStatus::Success)
    }
}

/// Per-transaction result of a batch run, finalized in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    /// Position of the transaction in the batch
    pub index: TxnIndex,
    /// Success or contract-initiated revert
    pub status: TransactionStatus,
    /// Return payload of the entry call, if any
    pub ret: Option<Bytes>,
    /// Event logs emitted by the committed attempt
    pub logs: Vec<LogEntry>,
    /// Number of attempts it took to finalize (1 = no conflict)
    pub attempts: AttemptNumber,
}
