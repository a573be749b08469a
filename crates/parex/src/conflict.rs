//! Resource conflict tracking across concurrently running tasks.
//!
//! The tracker owns a concurrent key-ownership table: every fine-grained
//! [`StateKey`] an in-flight attempt touches is declared here, and an overlap
//! between two live attempts is a conflict. Resolution direction is fixed by
//! the batch order: of two conflicting tasks, only the one with the higher
//! index is ever signalled to abort, so the earlier point in serial order is
//! never cancelled by a later one.
//!
//! Per-key entry locking makes concurrent declares deterministic: two tasks
//! declaring the same key simultaneously produce exactly one conflict
//! detection, never zero or two.

use std::{collections::BTreeSet, sync::Arc};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    task::Task,
    types::{StateKey, TxnIndex},
};

/// Outcome of declaring a key access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No live lower-index task holds the key; execution may continue.
    Granted,
    /// A lower-index task holds the key; the declaring task has been
    /// signalled to abort and should unwind at its next checkpoint.
    SelfAborted,
}

impl Access {
    pub fn is_granted(&self) -> bool {
        matches!(self, Access::Granted)
    }
}

/// Concurrent table of which in-flight task touched which state key.
pub struct ConflictTracker {
    tasks: Vec<Arc<Task>>,
    owners: DashMap<StateKey, Vec<TxnIndex>>,
}

impl ConflictTracker {
    /// Create a tracker over the batch's tasks, indexed by `TxnIndex`.
    pub fn new(tasks: Vec<Arc<Task>>) -> Self {
        Self {
            tasks,
            owners: DashMap::new(),
        }
    }

    pub fn task(&self, index: TxnIndex) -> &Arc<Task> {
        &self.tasks[index as usize]
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Declare that `task`'s current attempt touched `key`.
    ///
    /// The key is recorded in the task's attempt-scoped conflict set and
    /// checked against every key currently declared by other in-flight
    /// tasks. On overlap the higher-index side is signalled to abort: either
    /// a later task loses immediately, or `task` itself is told to unwind.
    pub fn declare_access(&self, task: &Task, key: StateKey) -> Access {
        if !task.record_conflict_key(key.clone()) {
            // already declared by this attempt; any overlap was resolved then
            return Access::Granted;
        }

        let mut lost = false;
        {
            let mut owners = self.owners.entry(key.clone()).or_default();
            if !owners.contains(&task.index()) {
                owners.push(task.index());
            }
            for &other in owners.iter() {
                if other == task.index() {
                    continue;
                }
                if other < task.index() {
                    lost = true;
                } else {
                    debug!(
                        target: "parex::conflict",
                        key = %key,
                        winner = task.index(),
                        loser = other,
                        "conflict: aborting higher-index task"
                    );
                    self.tasks[other as usize].set_abort();
                }
            }
        }

        if lost {
            debug!(
                target: "parex::conflict",
                key = %key,
                loser = task.index(),
                "conflict: lost to lower-index task"
            );
            task.set_abort();
            Access::SelfAborted
        } else {
            Access::Granted
        }
    }

    /// Indices of in-flight tasks whose declared keys overlap `task`'s.
    pub fn conflicts_with(&self, task: &Task) -> BTreeSet<TxnIndex> {
        let mut conflicting = BTreeSet::new();
        for key in task.conflict_keys() {
            if let Some(owners) = self.owners.get(&key) {
                for &other in owners.iter() {
                    if other != task.index() {
                        conflicting.insert(other);
                    }
                }
            }
        }
        conflicting
    }

    /// Withdraw every key declaration of `task`'s current attempt.
    ///
    /// Called when the attempt commits (keys become permanently settled
    /// state) and when it is torn down for retry.
    pub fn release(&self, task: &Task) {
        for key in task.drain_conflict_keys() {
            let remove_entry = {
                let Some(mut owners) = self.owners.get_mut(&key) else {
                    continue;
                };
                owners.retain(|&idx| idx != task.index());
                owners.is_empty()
            };
            if remove_entry {
                self.owners.remove_if(&key, |_, owners| owners.is_empty());
            }
        }
    }

    /// Number of keys with at least one live declaration.
    pub fn live_key_count(&self) -> usize {
        self.owners.len()
    }
}
