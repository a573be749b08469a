//! Per-transaction execution context and its cross-thread abort protocol.
//!
//! A [`Task`] represents one transaction of a batch and carries everything a
//! single attempt at executing it needs: the abort flag other threads use to
//! cancel it, the exclusive slot for the worker's execution context, and the
//! attempt-scoped buffers (conflict keys, call stack, output, event logs)
//! that are discarded together on every reset.
//!
//! Only two fields are ever mutated from a thread other than the task's own
//! worker: the abort flag and the bound-context slot. Everything else is
//! owned by whichever worker currently runs the attempt.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use alloy_primitives::Address;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    context::ExecutionContext,
    reentrant::{ContractInstance, ReentrantStack},
    types::{AttemptNumber, LogEntry, StateKey, TaskStatus, TxnIndex},
};

/// Default bound on inter-contract call nesting.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 10;

/// Fatal coordination faults.
///
/// These indicate a bug in the coordination logic, not a data condition, and
/// must stop the whole batch run rather than be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A context was bound while another one was still attached.
    DoubleBind { index: TxnIndex },
    /// Unbind was requested with no context attached.
    UnbindWithoutBind { index: TxnIndex },
    /// A lifecycle operation was applied in a state that does not allow it.
    InvalidTransition {
        index: TxnIndex,
        from: TaskStatus,
        op: &'static str,
    },
    /// A call exit had no matching call entry.
    CallDepthUnderflow { index: TxnIndex },
    /// An attempt reached commit with calls still open.
    UnbalancedCallDepth { index: TxnIndex, depth: u32 },
    /// Reset was requested on a task that already committed.
    ResetAfterCommit { index: TxnIndex },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::DoubleBind { index } => {
                write!(f, "task {index}: execution context already bound")
            }
            Fault::UnbindWithoutBind { index } => {
                write!(f, "task {index}: unbind without a bound execution context")
            }
            Fault::InvalidTransition { index, from, op } => {
                write!(f, "task {index}: cannot {op} while {from}")
            }
            Fault::CallDepthUnderflow { index } => {
                write!(f, "task {index}: call exit without matching entry")
            }
            Fault::UnbalancedCallDepth { index, depth } => {
                write!(f, "task {index}: commit with {depth} calls still open")
            }
            Fault::ResetAfterCommit { index } => {
                write!(f, "task {index}: reset after commit")
            }
        }
    }
}

impl std::error::Error for Fault {}

/// Error from [`Task::enter_call`].
///
/// Exceeding the configured depth limit is produced by contract behavior
/// (runaway recursion) and terminates the attempt like failed business
/// logic; it is not a coordination fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    DepthLimit { index: TxnIndex, max: u32 },
    Fault(Fault),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::DepthLimit { index, max } => {
                write!(f, "task {index}: call depth limit {max} exceeded")
            }
            CallError::Fault(fault) => fault.fmt(f),
        }
    }
}

impl std::error::Error for CallError {}

impl From<Fault> for CallError {
    fn from(fault: Fault) -> Self {
        CallError::Fault(fault)
    }
}

/// Attempt-scoped state, fully reset together on every retry.
#[derive(Debug, Default)]
struct AttemptState {
    conflict_keys: HashSet<StateKey>,
    call_depth: u32,
    reentrant: ReentrantStack,
    out_buffer: String,
    logs: Vec<LogEntry>,
}

impl AttemptState {
    fn clear(&mut self) {
        self.conflict_keys.clear();
        self.call_depth = 0;
        self.reentrant.clear();
        self.out_buffer.clear();
        self.logs.clear();
    }
}

/// Observable effects of a committed attempt.
#[derive(Debug)]
pub struct CommittedAttempt {
    /// Event logs emitted by the committed attempt.
    pub logs: Vec<LogEntry>,
    /// Accumulated diagnostic output, flushed exactly once.
    pub output: String,
}

/// Mutable execution context for one transaction of a batch.
///
/// Created once per external transaction and re-initialized (new attempt) any
/// number of times on abort; terminal once an attempt commits. The `index` is
/// immutable and totally orders tasks: under contention the lower index - the
/// earlier point in serial order - always wins.
#[derive(Debug)]
pub struct Task {
    index: TxnIndex,
    origin: Option<Address>,
    max_call_depth: u32,
    abort_requested: AtomicBool,
    committed: AtomicBool,
    bound: Mutex<Option<ExecutionContext>>,
    state: Mutex<(AttemptNumber, TaskStatus)>,
    attempt: Mutex<AttemptState>,
}

impl Task {
    pub fn new(index: TxnIndex, origin: Option<Address>, max_call_depth: u32) -> Self {
        Self {
            index,
            origin,
            max_call_depth,
            abort_requested: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            bound: Mutex::new(None),
            state: Mutex::new((0, TaskStatus::Created)),
            attempt: Mutex::new(AttemptState::default()),
        }
    }

    pub fn index(&self) -> TxnIndex {
        self.index
    }

    pub fn origin(&self) -> Option<Address> {
        self.origin
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().1
    }

    pub fn attempt_number(&self) -> AttemptNumber {
        self.state.lock().0
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Attach an execution context to this task for one attempt.
    ///
    /// If an abort was already requested before a worker picked the task up,
    /// the signal is propagated into the newly bound context immediately so
    /// the attempt is cancelled promptly instead of running to completion.
    pub fn bind(&self, ctx: &ExecutionContext) -> Result<(), Fault> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(Fault::DoubleBind { index: self.index });
        }
        {
            let (_, status) = *self.state.lock();
            if !matches!(status, TaskStatus::Created) {
                return Err(Fault::InvalidTransition {
                    index: self.index,
                    from: status,
                    op: "bind",
                });
            }
        }
        *bound = Some(ctx.clone());
        if self.abort_requested.load(Ordering::Acquire) {
            ctx.request_abort();
        }
        drop(bound);
        self.state.lock().1 = TaskStatus::Bound;
        Ok(())
    }

    /// Detach the bound execution context.
    pub fn unbind(&self) -> Result<ExecutionContext, Fault> {
        let ctx = self
            .bound
            .lock()
            .take()
            .ok_or(Fault::UnbindWithoutBind { index: self.index })?;
        if self.abort_requested.load(Ordering::Acquire) {
            let mut state = self.state.lock();
            if state.1 != TaskStatus::Committed {
                state.1 = TaskStatus::Aborted;
            }
        }
        Ok(ctx)
    }

    /// Mark the attempt as running. Call depth and the reentrancy stack
    /// mutate only from this state.
    pub fn mark_running(&self) -> Result<(), Fault> {
        let mut state = self.state.lock();
        if state.1 != TaskStatus::Bound {
            return Err(Fault::InvalidTransition {
                index: self.index,
                from: state.1,
                op: "run",
            });
        }
        state.1 = TaskStatus::Running;
        Ok(())
    }

    /// Request abort of the current attempt.
    ///
    /// A request, not a guarantee of immediate stop: the bound context
    /// observes the signal at its next cooperative checkpoint. Idempotent,
    /// and a no-op once the task has committed.
    pub fn set_abort(&self) {
        if self.committed.load(Ordering::Acquire) {
            return;
        }
        self.abort_requested.store(true, Ordering::Release);
        if let Some(ctx) = &*self.bound.lock() {
            ctx.request_abort();
        }
        debug!(target: "parex::task", index = self.index, "abort requested");
    }

    /// Finalize the attempt if no abort won the race.
    ///
    /// Returns `Ok(None)` when the abort flag was set at the atomic commit
    /// check: the caller resets and retries. On success the output buffer is
    /// flushed as a single log event, so two tasks' buffers never interleave.
    pub fn try_commit(&self) -> Result<Option<CommittedAttempt>, Fault> {
        {
            let mut state = self.state.lock();
            match state.1 {
                TaskStatus::Aborted => return Ok(None),
                TaskStatus::Running => {}
                from => {
                    return Err(Fault::InvalidTransition {
                        index: self.index,
                        from,
                        op: "commit",
                    })
                }
            }
            if self.abort_requested.load(Ordering::Acquire) {
                state.1 = TaskStatus::Aborted;
                return Ok(None);
            }
            let depth = self.attempt.lock().call_depth;
            if depth != 0 {
                return Err(Fault::UnbalancedCallDepth {
                    index: self.index,
                    depth,
                });
            }
            self.committed.store(true, Ordering::Release);
            state.1 = TaskStatus::Committed;
        }

        let mut attempt = self.attempt.lock();
        let logs = std::mem::take(&mut attempt.logs);
        let output = std::mem::take(&mut attempt.out_buffer);
        drop(attempt);

        if !output.is_empty() {
            info!(
                target: "parex::task",
                index = self.index,
                output = %output,
                "transaction output"
            );
        }
        Ok(Some(CommittedAttempt { logs, output }))
    }

    /// Start a brand-new attempt after an abort.
    ///
    /// Clears the abort flag, unbinds any context, and discards all
    /// attempt-scoped state; `index` and `origin` are untouched.
    pub fn reset(&self) -> Result<AttemptNumber, Fault> {
        let next = {
            let mut state = self.state.lock();
            if state.1 == TaskStatus::Committed {
                return Err(Fault::ResetAfterCommit { index: self.index });
            }
            state.0 += 1;
            state.1 = TaskStatus::Created;
            state.0
        };
        self.abort_requested.store(false, Ordering::Release);
        *self.bound.lock() = None;
        self.attempt.lock().clear();
        debug!(target: "parex::task", index = self.index, attempt = next, "task reset");
        Ok(next)
    }

    /// Enter a nested inter-contract call.
    ///
    /// If the target contract is already on this attempt's stack the existing
    /// instance is reused; otherwise `load` produces a fresh one.
    pub fn enter_call<F>(&self, address: Address, load: F) -> Result<Arc<ContractInstance>, CallError>
    where
        F: FnOnce() -> Arc<ContractInstance>,
    {
        let status = self.status();
        if status != TaskStatus::Running {
            return Err(Fault::InvalidTransition {
                index: self.index,
                from: status,
                op: "enter call",
            }
            .into());
        }
        let mut attempt = self.attempt.lock();
        if attempt.call_depth >= self.max_call_depth {
            return Err(CallError::DepthLimit {
                index: self.index,
                max: self.max_call_depth,
            });
        }
        attempt.call_depth += 1;
        let instance = match attempt.reentrant.find(address) {
            Some(existing) => existing,
            None => load(),
        };
        attempt.reentrant.push(Arc::clone(&instance));
        Ok(instance)
    }

    /// Return from a nested inter-contract call.
    pub fn exit_call(&self) -> Result<(), Fault> {
        let mut attempt = self.attempt.lock();
        if attempt.call_depth == 0 {
            return Err(Fault::CallDepthUnderflow { index: self.index });
        }
        attempt.call_depth -= 1;
        attempt.reentrant.pop();
        Ok(())
    }

    pub fn call_depth(&self) -> u32 {
        self.attempt.lock().call_depth
    }

    /// Append to the attempt's diagnostic output buffer. Nothing is emitted
    /// until the attempt commits.
    pub fn print(&self, text: &str) {
        self.attempt.lock().out_buffer.push_str(text);
    }

    pub fn println(&self, line: &str) {
        let mut attempt = self.attempt.lock();
        attempt.out_buffer.push_str(line);
        attempt.out_buffer.push('\n');
    }

    pub fn emit_log(&self, entry: LogEntry) {
        self.attempt.lock().logs.push(entry);
    }

    pub(crate) fn record_conflict_key(&self, key: StateKey) -> bool {
        self.attempt.lock().conflict_keys.insert(key)
    }

    pub(crate) fn drain_conflict_keys(&self) -> HashSet<StateKey> {
        std::mem::take(&mut self.attempt.lock().conflict_keys)
    }

    pub fn conflict_keys(&self) -> Vec<StateKey> {
        self.attempt.lock().conflict_keys.iter().cloned().collect()
    }

    pub fn conflict_key_count(&self) -> usize {
        self.attempt.lock().conflict_keys.len()
    }
}

// Total order by batch index; the lower the index, the higher the priority.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.index.cmp(&other.index)
    }
}
