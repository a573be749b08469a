//! Execution context bound to a running task.
//!
//! The context is the explicit value a worker binds to a task for the
//! duration of one attempt. It carries a shared abort cell: the sandboxed
//! interpreter polls the cell at cooperative checkpoints (between individual
//! operations of the executed program) and unwinds promptly once it is set.
//! Cancellation is cooperative, never preemptive.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Error returned by [`ExecutionContext::checkpoint`] once an abort has been
/// requested. Not a failure: an expected control-flow outcome of optimistic
/// concurrency, resolved by reset and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionAborted;

impl std::fmt::Display for ExecutionAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "execution aborted at cooperative checkpoint")
    }
}

impl std::error::Error for ExecutionAborted {}

/// Handle to one attempt's abort cell.
///
/// Clones share the same cell, so the worker, the task, and the interpreter
/// all observe a single abort signal. A fresh context (fresh cell) is created
/// for every attempt; stale signals never leak across attempts.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    abort_cell: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the attempt this context is bound to.
    ///
    /// Fire-and-forget: no acknowledgment is required, and signalling twice
    /// has no additional effect.
    pub fn request_abort(&self) {
        self.abort_cell.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_cell.load(Ordering::Acquire)
    }

    /// Cooperative checkpoint: returns an error once an abort was requested.
    pub fn checkpoint(&self) -> Result<(), ExecutionAborted> {
        if self.abort_requested() {
            Err(ExecutionAborted)
        } else {
            Ok(())
        }
    }
}
