//! Transactional state access for one attempt.
//!
//! [`TaskView`] wraps the base store for the duration of a single attempt:
//! writes land in a private buffer invisible to other tasks, reads go
//! through the buffer first and fall back to the base store, and every
//! access is declared to the conflict tracker. Because each access is also
//! an abort checkpoint, a task that loses a conflict unwinds at its very
//! next state access instead of running its attempt to completion.
//!
//! The buffer is flushed to the base store only when the attempt commits;
//! dropping the view discards it.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, U256};
use dashmap::DashMap;

use crate::{
    conflict::ConflictTracker,
    task::Task,
    types::{StateKey, StateValue, TxnIndex},
};

/// Access error surfaced by [`TaskView`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    /// The attempt was cancelled; unwind and let the coordinator retry.
    #[error("task {index}: attempt aborted")]
    Aborted { index: TxnIndex },
}

/// Shared backing store the committed effects of a batch land in.
pub trait StateStore: Send + Sync {
    fn read(&self, key: &StateKey) -> Option<StateValue>;

    /// Apply a committed attempt's write set. Called from exactly one thread
    /// at a time, in ascending task-index order.
    fn apply(&self, writes: Vec<(StateKey, StateValue)>);
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: DashMap<StateKey, StateValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances<I>(balances: I) -> Self
    where
        I: IntoIterator<Item = (Address, U256)>,
    {
        let store = Self::new();
        for (addr, balance) in balances {
            store
                .data
                .insert(StateKey::Balance(addr), StateValue::Balance(balance));
        }
        store
    }

    pub fn insert(&self, key: StateKey, value: StateValue) {
        self.data.insert(key, value);
    }

    pub fn get(&self, key: &StateKey) -> Option<StateValue> {
        self.data.get(key).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ordered copy of the full store, for comparing two runs in tests.
    pub fn snapshot(&self) -> BTreeMap<StateKey, StateValue> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl StateStore for InMemoryStore {
    fn read(&self, key: &StateKey) -> Option<StateValue> {
        self.data.get(key).map(|v| v.clone())
    }

    fn apply(&self, writes: Vec<(StateKey, StateValue)>) {
        for (key, value) in writes {
            self.data.insert(key, value);
        }
    }
}

/// Per-attempt buffered view over the base store.
pub struct TaskView<'a, S: StateStore> {
    task: &'a Task,
    tracker: &'a ConflictTracker,
    base: &'a S,
    writes: HashMap<StateKey, StateValue>,
}

impl<'a, S: StateStore> TaskView<'a, S> {
    pub fn new(task: &'a Task, tracker: &'a ConflictTracker, base: &'a S) -> Self {
        Self {
            task,
            tracker,
            base,
            writes: HashMap::new(),
        }
    }

    fn declare(&self, key: &StateKey) -> Result<(), ViewError> {
        if self.task.abort_requested() {
            return Err(ViewError::Aborted {
                index: self.task.index(),
            });
        }
        if !self
            .tracker
            .declare_access(self.task, key.clone())
            .is_granted()
        {
            return Err(ViewError::Aborted {
                index: self.task.index(),
            });
        }
        Ok(())
    }

    pub fn read(&mut self, key: &StateKey) -> Result<Option<StateValue>, ViewError> {
        self.declare(key)?;
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.base.read(key))
    }

    pub fn write(&mut self, key: StateKey, value: StateValue) -> Result<(), ViewError> {
        self.declare(&key)?;
        self.writes.insert(key, value);
        Ok(())
    }

    /// Balance of `address`, defaulting to zero for untouched accounts.
    pub fn balance(&mut self, address: Address) -> Result<U256, ViewError> {
        Ok(self
            .read(&StateKey::Balance(address))?
            .and_then(|v| v.as_balance())
            .unwrap_or_default())
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Consume the view, yielding the write set for the commit flush.
    pub fn into_writes(self) -> Vec<(StateKey, StateValue)> {
        self.writes.into_iter().collect()
    }
}
