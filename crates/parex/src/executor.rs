//! Parallel batch execution over a pool of worker threads.
//!
//! Workers claim tasks in index order, execute attempts speculatively
//! through a caller-supplied closure (the sandboxed interpreter's entry
//! point), and resolve conflicts by abort and retry. Results become final
//! strictly in ascending index order behind an atomic commit cursor, so the
//! batch outcome is identical to running every transaction sequentially
//! against the same initial state.
//!
//! Conflict-aborts are handled entirely in here and never escape to the
//! caller; contract-initiated reverts surface as per-transaction results;
//! fatal coordination faults cancel the whole batch.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    thread,
};

use alloy_primitives::{Address, Bytes, U256};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    conflict::ConflictTracker,
    context::ExecutionContext,
    host::{BlockInfo, TransactionInfo, REVERT_CALL_DEPTH_EXCEEDED},
    reentrant::ContractInstance,
    state::{StateStore, TaskView, ViewError},
    task::{CallError, Fault, Task},
    types::{LogEntry, StateKey, StateValue, TransactionResult, TransactionStatus, TxnIndex},
};

/// A transaction the executor can schedule.
pub trait ExecutableTransaction: Send + Sync {
    /// Originating account, if the transaction carries one.
    fn origin(&self) -> Option<Address> {
        None
    }

    /// Metadata exposed to executed code through the host boundary.
    fn info(&self) -> TransactionInfo {
        TransactionInfo::default()
    }
}

/// Error terminating a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Engine-initiated cancellation; resolved internally by reset + retry.
    #[error("task {index}: attempt aborted")]
    Aborted { index: TxnIndex },
    /// Contract-initiated rollback; a normal per-transaction outcome.
    #[error("reverted with code {code}")]
    Revert { code: u32, message: Option<String> },
    /// Coordination bug; stops the whole batch.
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl From<ViewError> for ExecutionError {
    fn from(err: ViewError) -> Self {
        match err {
            ViewError::Aborted { index } => ExecutionError::Aborted { index },
        }
    }
}

impl From<CallError> for ExecutionError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::DepthLimit { max, .. } => ExecutionError::Revert {
                code: REVERT_CALL_DEPTH_EXCEEDED,
                message: Some(format!("call depth limit {max} exceeded")),
            },
            CallError::Fault(fault) => ExecutionError::Fault(fault),
        }
    }
}

/// Error returned for a batch run as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("batch cancelled after {committed} committed transactions")]
    Cancelled { committed: usize },
}

/// Tuning knobs for a batch run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads; capped at the batch size.
    pub num_threads: usize,
    /// Bound on inter-contract call nesting per task.
    pub max_call_depth: u32,
    /// Conflict-aborted attempts a task may burn before its next retry is
    /// deferred to its own commit turn, where it runs against fully settled
    /// state and cannot lose again. Bounds retries for every task.
    pub spin_retry_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            max_call_depth: crate::task::DEFAULT_MAX_CALL_DEPTH,
            spin_retry_limit: 3,
        }
    }
}

/// Everything one attempt may touch: the buffered state view, the abort
/// checkpoints, the call bookkeeping, and the output/log buffers. This is
/// what a host-API implementation builds on.
pub struct AttemptEnv<'a, S: StateStore> {
    task: &'a Task,
    ctx: &'a ExecutionContext,
    view: TaskView<'a, S>,
    tx_info: TransactionInfo,
    block: BlockInfo,
}

impl<'a, S: StateStore> AttemptEnv<'a, S> {
    fn new(
        task: &'a Task,
        ctx: &'a ExecutionContext,
        tracker: &'a ConflictTracker,
        store: &'a S,
        tx_info: TransactionInfo,
        block: BlockInfo,
    ) -> Self {
        Self {
            task,
            ctx,
            view: TaskView::new(task, tracker, store),
            tx_info,
            block,
        }
    }

    pub fn index(&self) -> TxnIndex {
        self.task.index()
    }

    pub fn origin(&self) -> Option<Address> {
        self.task.origin()
    }

    pub fn transaction(&self) -> &TransactionInfo {
        &self.tx_info
    }

    pub fn block(&self) -> &BlockInfo {
        &self.block
    }

    /// Cooperative checkpoint; call between operations of the executed
    /// program. State accesses check implicitly.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        self.ctx
            .checkpoint()
            .map_err(|_| ExecutionError::Aborted {
                index: self.task.index(),
            })
    }

    pub fn read(&mut self, key: &StateKey) -> Result<Option<StateValue>, ExecutionError> {
        Ok(self.view.read(key)?)
    }

    pub fn write(&mut self, key: StateKey, value: StateValue) -> Result<(), ExecutionError> {
        Ok(self.view.write(key, value)?)
    }

    pub fn balance(&mut self, address: Address) -> Result<U256, ExecutionError> {
        Ok(self.view.balance(address)?)
    }

    pub fn println(&self, line: &str) {
        self.task.println(line);
    }

    pub fn print(&self, text: &str) {
        self.task.print(text);
    }

    pub fn emit_log(&self, address: Address, indexed: Vec<Bytes>, data: Vec<Bytes>) {
        self.task.emit_log(LogEntry {
            address,
            indexed,
            data,
        });
    }

    /// Enter a nested inter-contract call; reentrant targets reuse the
    /// already-loaded instance.
    pub fn enter_call<F>(
        &self,
        address: Address,
        load: F,
    ) -> Result<Arc<ContractInstance>, ExecutionError>
    where
        F: FnOnce() -> Arc<ContractInstance>,
    {
        Ok(self.task.enter_call(address, load)?)
    }

    pub fn exit_call(&self) -> Result<(), ExecutionError> {
        Ok(self.task.exit_call()?)
    }

    pub fn call_depth(&self) -> u32 {
        self.task.call_depth()
    }

    fn into_view(self) -> TaskView<'a, S> {
        self.view
    }
}

/// How a finished (non-aborted) attempt ended.
enum AttemptEnd {
    Success(Option<Bytes>),
    Revert { code: u32, message: Option<String> },
}

/// Speculative parallel executor for one batch of ordered transactions.
#[derive(Debug, Default)]
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `transactions` against `store`, returning per-transaction
    /// results in index order.
    ///
    /// `execute` runs one attempt of one transaction and is called from
    /// worker threads, possibly several times per transaction. The final
    /// committed effects are equivalent to executing the batch sequentially
    /// in ascending index order against the same initial state.
    pub fn execute_batch<T, S, F>(
        &self,
        transactions: &[T],
        store: &S,
        block: BlockInfo,
        cancel: CancellationToken,
        execute: F,
    ) -> Result<Vec<TransactionResult>, BatchError>
    where
        T: ExecutableTransaction,
        S: StateStore,
        F: Fn(&T, &mut AttemptEnv<'_, S>) -> Result<Option<Bytes>, ExecutionError> + Send + Sync,
    {
        let num_txns = transactions.len();
        if num_txns == 0 {
            return Ok(Vec::new());
        }
        let num_threads = self.config.num_threads.clamp(1, num_txns);

        let tasks: Vec<Arc<Task>> = transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| {
                Arc::new(Task::new(
                    i as TxnIndex,
                    tx.origin(),
                    self.config.max_call_depth,
                ))
            })
            .collect();
        let tracker = ConflictTracker::new(tasks.clone());

        let results: Mutex<Vec<Option<TransactionResult>>> = Mutex::new(vec![None; num_txns]);
        let claim_cursor = AtomicUsize::new(0);
        let commit_cursor = AtomicUsize::new(0);
        let fatal: Mutex<Option<Fault>> = Mutex::new(None);

        thread::scope(|s| {
            for worker_id in 0..num_threads {
                let cancel = cancel.clone();
                let tasks = &tasks;
                let tracker = &tracker;
                let results = &results;
                let claim_cursor = &claim_cursor;
                let commit_cursor = &commit_cursor;
                let fatal = &fatal;
                let execute = &execute;
                let config = &self.config;

                s.spawn(move || {
                    let outcome = Self::run_worker(
                        worker_id,
                        transactions,
                        store,
                        block,
                        &cancel,
                        tasks,
                        tracker,
                        results,
                        claim_cursor,
                        commit_cursor,
                        config,
                        execute,
                    );
                    if let Err(fault) = outcome {
                        warn!(
                            target: "parex::executor",
                            worker_id,
                            fault = %fault,
                            "fatal coordination fault, cancelling batch"
                        );
                        *fatal.lock() = Some(fault);
                        cancel.cancel();
                    }
                });
            }
        });

        if let Some(fault) = fatal.into_inner() {
            return Err(BatchError::Fault(fault));
        }
        let committed = commit_cursor.into_inner();
        if committed < num_txns {
            return Err(BatchError::Cancelled { committed });
        }
        Ok(results
            .into_inner()
            .into_iter()
            .map(|slot| slot.expect("every index below the commit cursor has a result"))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker<T, S, F>(
        worker_id: usize,
        transactions: &[T],
        store: &S,
        block: BlockInfo,
        cancel: &CancellationToken,
        tasks: &[Arc<Task>],
        tracker: &ConflictTracker,
        results: &Mutex<Vec<Option<TransactionResult>>>,
        claim_cursor: &AtomicUsize,
        commit_cursor: &AtomicUsize,
        config: &ExecutorConfig,
        execute: &F,
    ) -> Result<(), Fault>
    where
        T: ExecutableTransaction,
        S: StateStore,
        F: Fn(&T, &mut AttemptEnv<'_, S>) -> Result<Option<Bytes>, ExecutionError> + Send + Sync,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let index = claim_cursor.fetch_add(1, Ordering::SeqCst);
            if index >= transactions.len() {
                return Ok(());
            }
            let task = &tasks[index];
            let tx = &transactions[index];
            let mut lost_attempts = 0u32;

            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if lost_attempts >= config.spin_retry_limit {
                    // contended past the spin budget: run at our own commit
                    // turn, against fully settled lower-index state
                    while commit_cursor.load(Ordering::Acquire) < index {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        thread::yield_now();
                    }
                }

                debug!(
                    target: "parex::executor",
                    worker_id,
                    txn_idx = index,
                    attempt = task.attempt_number(),
                    "executing attempt"
                );

                let ctx = ExecutionContext::new();
                task.bind(&ctx)?;
                task.mark_running()?;
                let mut tx_info = tx.info();
                tx_info.index = task.index();
                let mut env = AttemptEnv::new(task, &ctx, tracker, store, tx_info, block);
                let outcome = execute(tx, &mut env);
                let view = env.into_view();
                task.unbind()?;

                let end = match outcome {
                    Ok(ret) => AttemptEnd::Success(ret),
                    Err(ExecutionError::Revert { code, message }) => {
                        AttemptEnd::Revert { code, message }
                    }
                    Err(ExecutionError::Aborted { .. }) => {
                        drop(view);
                        tracker.release(task);
                        task.reset()?;
                        lost_attempts += 1;
                        debug!(
                            target: "parex::executor",
                            worker_id,
                            txn_idx = index,
                            lost_attempts,
                            "attempt aborted by conflict, retrying"
                        );
                        continue;
                    }
                    Err(ExecutionError::Fault(fault)) => return Err(fault),
                };

                // completed speculatively; results become visible in index
                // order only
                while commit_cursor.load(Ordering::Acquire) != index {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    thread::yield_now();
                }

                match task.try_commit()? {
                    Some(committed) => {
                        let result = match end {
                            AttemptEnd::Success(ret) => {
                                store.apply(view.into_writes());
                                TransactionResult {
                                    index: task.index(),
                                    status: TransactionStatus::Success,
                                    ret,
                                    logs: committed.logs,
                                    attempts: task.attempt_number() + 1,
                                }
                            }
                            AttemptEnd::Revert { code, message } => {
                                warn!(
                                    target: "parex::executor",
                                    txn_idx = index,
                                    code,
                                    "transaction reverted"
                                );
                                drop(view);
                                TransactionResult {
                                    index: task.index(),
                                    status: TransactionStatus::Reverted { code, message },
                                    ret: None,
                                    logs: Vec::new(),
                                    attempts: task.attempt_number() + 1,
                                }
                            }
                        };
                        tracker.release(task);
                        results.lock()[index] = Some(result);
                        commit_cursor.store(index + 1, Ordering::Release);
                        break;
                    }
                    None => {
                        // an abort won the race against this commit; the
                        // commit turn is already ours, so the retry runs
                        // serially and must succeed
                        drop(view);
                        tracker.release(task);
                        task.reset()?;
                        lost_attempts += 1;
                        continue;
                    }
                }
            }
        }
    }
}
