//! Parallelization tests for the execution coordinator.
//!
//! These tests verify the correct behavior of speculative parallel
//! execution, including conflict detection, abort/retry, deterministic
//! in-order commit and equivalence with a sequential run.

use std::sync::Arc;
use std::thread;

use alloy_primitives::{Address, Bytes, U256};
use rand::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    conflict::ConflictTracker,
    executor::{AttemptEnv, BatchError, ExecutableTransaction, ExecutionError, ExecutorConfig, ParallelExecutor},
    host::BlockInfo,
    state::InMemoryStore,
    task::{Task, DEFAULT_MAX_CALL_DEPTH},
    types::{StateKey, StateValue, TransactionResult, TransactionStatus},
};

/// Helper to create a counter key.
fn counter_key(slot: u8) -> StateKey {
    StateKey::Storage(Address::repeat_byte(0x42), Bytes::from(vec![slot]))
}

fn counter_value(v: u64) -> StateValue {
    StateValue::Storage(Bytes::copy_from_slice(&v.to_le_bytes()))
}

fn as_counter(v: &StateValue) -> u64 {
    let bytes = v.as_storage().expect("counter is a storage value");
    u64::from_le_bytes(bytes[..8].try_into().expect("8-byte counter"))
}

/// Simulated transaction: increments a set of counters read-modify-write.
#[derive(Clone, Debug)]
struct SimTx {
    origin: Address,
    increments: Vec<StateKey>,
}

impl ExecutableTransaction for SimTx {
    fn origin(&self) -> Option<Address> {
        Some(self.origin)
    }
}

fn run_increments(
    tx: &SimTx,
    env: &mut AttemptEnv<'_, InMemoryStore>,
) -> Result<Option<Bytes>, ExecutionError> {
    let mut last = 0u64;
    for key in &tx.increments {
        let current = env.read(key)?.map(|v| as_counter(&v)).unwrap_or(0);
        env.checkpoint()?;
        last = current + 1;
        env.write(key.clone(), counter_value(last))?;
    }
    Ok(Some(Bytes::copy_from_slice(&last.to_le_bytes())))
}

fn run_batch(
    txs: &[SimTx],
    num_threads: usize,
    spin_retry_limit: u32,
) -> (
    std::collections::BTreeMap<StateKey, StateValue>,
    Vec<TransactionResult>,
) {
    let store = InMemoryStore::new();
    let executor = ParallelExecutor::new(ExecutorConfig {
        num_threads,
        max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        spin_retry_limit,
    });
    let results = executor
        .execute_batch(
            txs,
            &store,
            BlockInfo::default(),
            CancellationToken::new(),
            run_increments,
        )
        .expect("batch completes");
    (store.snapshot(), results)
}

/// Everything that must be scheduling-independent about a result.
fn observable(results: &[TransactionResult]) -> Vec<(TransactionStatus, Option<Bytes>, usize)> {
    results
        .iter()
        .map(|r| (r.status.clone(), r.ret.clone(), r.logs.len()))
        .collect()
}

#[test]
fn parallel_run_matches_sequential_run() {
    let mut rng = rand::rng();

    for round in 0..8 {
        let num_txns = 12;
        let txs: Vec<SimTx> = (0..num_txns)
            .map(|i| {
                let n_keys = rng.random_range(1..=3);
                let increments = (0..n_keys)
                    .map(|_| counter_key(rng.random_range(0..4)))
                    .collect();
                SimTx {
                    origin: Address::repeat_byte(i as u8 + 1),
                    increments,
                }
            })
            .collect();

        // one worker claiming in index order is the sequential reference
        let (sequential_state, sequential_results) = run_batch(&txs, 1, 3);
        let (parallel_state, parallel_results) = run_batch(&txs, 4, 3);

        assert_eq!(
            parallel_state, sequential_state,
            "state diverged in round {round}"
        );
        assert_eq!(
            observable(&parallel_results),
            observable(&sequential_results),
            "results diverged in round {round}"
        );
    }
}

#[test]
fn contended_counter_serializes_to_batch_size() {
    let num_txns = 16;
    let txs: Vec<SimTx> = (0..num_txns)
        .map(|i| SimTx {
            origin: Address::repeat_byte(i as u8 + 1),
            increments: vec![counter_key(0)],
        })
        .collect();

    let (state, results) = run_batch(&txs, 4, 3);

    assert_eq!(as_counter(&state[&counter_key(0)]), num_txns as u64);
    for (i, result) in results.iter().enumerate() {
        assert!(result.status.is_success());
        // transaction i observes exactly i prior increments
        assert_eq!(
            result.ret.as_deref().map(|b| b.as_ref()),
            Some(((i as u64) + 1).to_le_bytes().as_slice())
        );
    }
}

#[test]
fn zero_spin_budget_degrades_to_serial_first_attempts() {
    let num_txns = 8;
    let txs: Vec<SimTx> = (0..num_txns)
        .map(|i| SimTx {
            origin: Address::repeat_byte(i as u8 + 1),
            increments: vec![counter_key(0)],
        })
        .collect();

    let (state, results) = run_batch(&txs, 4, 0);

    assert_eq!(as_counter(&state[&counter_key(0)]), num_txns as u64);
    // every task waited for its commit turn before its first attempt, so no
    // attempt was ever wasted
    for result in &results {
        assert_eq!(result.attempts, 1);
    }
}

#[test]
fn retries_are_bounded_under_heavy_contention() {
    let num_txns = 24;
    let spin_retry_limit = 2;
    let txs: Vec<SimTx> = (0..num_txns)
        .map(|i| SimTx {
            origin: Address::repeat_byte(i as u8 + 1),
            increments: vec![counter_key(0), counter_key(1)],
        })
        .collect();

    let (_, results) = run_batch(&txs, 8, spin_retry_limit);

    for result in &results {
        // spin attempts, plus at most one abort at the commit turn, plus the
        // final serial attempt
        assert!(
            result.attempts <= spin_retry_limit + 2,
            "task {} took {} attempts",
            result.index,
            result.attempts
        );
    }
}

#[test]
fn conflict_direction_lowest_declarer_always_survives() {
    // many tasks race on one key from many threads; whatever the
    // interleaving, only the minimum index is never abort-requested
    for _ in 0..32 {
        let num_tasks = 6u32;
        let tasks: Vec<Arc<Task>> = (0..num_tasks)
            .map(|i| Arc::new(Task::new(i, None, DEFAULT_MAX_CALL_DEPTH)))
            .collect();
        let tracker = Arc::new(ConflictTracker::new(tasks.clone()));
        let key = counter_key(0xee);

        thread::scope(|s| {
            for task in &tasks {
                let tracker = Arc::clone(&tracker);
                let key = key.clone();
                s.spawn(move || {
                    tracker.declare_access(task, key);
                });
            }
        });

        assert!(!tasks[0].abort_requested(), "lowest index was aborted");
        for task in &tasks[1..] {
            assert!(
                task.abort_requested(),
                "task {} escaped the conflict",
                task.index()
            );
        }
    }
}

#[derive(Clone, Debug)]
struct TransferTx {
    from: Address,
    to: Address,
    amount: u64,
}

impl ExecutableTransaction for TransferTx {
    fn origin(&self) -> Option<Address> {
        Some(self.from)
    }
}

fn run_transfer(
    tx: &TransferTx,
    env: &mut AttemptEnv<'_, InMemoryStore>,
) -> Result<Option<Bytes>, ExecutionError> {
    let from_balance = env.balance(tx.from)?;
    let amount = U256::from(tx.amount);
    if from_balance < amount {
        return Err(ExecutionError::Revert {
            code: 1,
            message: Some("insufficient balance".into()),
        });
    }
    let to_balance = env.balance(tx.to)?;
    env.write(
        StateKey::Balance(tx.from),
        StateValue::Balance(from_balance - amount),
    )?;
    env.write(
        StateKey::Balance(tx.to),
        StateValue::Balance(to_balance + amount),
    )?;
    env.emit_log(tx.from, vec![Bytes::from(tx.to.to_vec())], vec![]);
    Ok(None)
}

#[test]
fn random_transfers_match_sequential_and_conserve_funds() {
    let mut rng = rand::rng();
    let accounts: Vec<Address> = (1..=5u8).map(Address::repeat_byte).collect();
    let initial = 100u64;

    for _ in 0..6 {
        let txs: Vec<TransferTx> = (0..15)
            .map(|_| {
                let from = accounts[rng.random_range(0..accounts.len())];
                let to = accounts[rng.random_range(0..accounts.len())];
                TransferTx {
                    from,
                    to,
                    // large amounts provoke data-dependent reverts
                    amount: rng.random_range(1..150),
                }
            })
            .collect();

        let run = |num_threads: usize| {
            let store = InMemoryStore::with_balances(
                accounts.iter().map(|&a| (a, U256::from(initial))),
            );
            let executor = ParallelExecutor::new(ExecutorConfig {
                num_threads,
                ..Default::default()
            });
            let results = executor
                .execute_batch(
                    &txs,
                    &store,
                    BlockInfo::default(),
                    CancellationToken::new(),
                    run_transfer,
                )
                .expect("batch completes");
            (store.snapshot(), results)
        };

        let (seq_state, seq_results) = run(1);
        let (par_state, par_results) = run(4);

        assert_eq!(par_state, seq_state);
        assert_eq!(observable(&par_results), observable(&seq_results));

        let total: u64 = accounts
            .iter()
            .map(|a| {
                par_state
                    .get(&StateKey::Balance(*a))
                    .and_then(|v| v.as_balance())
                    .unwrap_or_default()
                    .to::<u64>()
            })
            .sum();
        assert_eq!(total, initial * accounts.len() as u64);
    }
}

#[test]
fn committed_logs_come_from_the_final_attempt_only() {
    // every transaction logs once per attempt; aborted attempts' logs must
    // be discarded with the rest of the attempt state
    let num_txns = 10;
    let txs: Vec<SimTx> = (0..num_txns)
        .map(|i| SimTx {
            origin: Address::repeat_byte(i as u8 + 1),
            increments: vec![counter_key(0)],
        })
        .collect();

    let store = InMemoryStore::new();
    let executor = ParallelExecutor::new(ExecutorConfig {
        num_threads: 4,
        ..Default::default()
    });
    let results = executor
        .execute_batch(
            &txs,
            &store,
            BlockInfo::default(),
            CancellationToken::new(),
            |tx: &SimTx, env: &mut AttemptEnv<'_, InMemoryStore>| {
                env.emit_log(tx.origin, vec![], vec![]);
                run_increments(tx, env)
            },
        )
        .expect("batch completes");

    for result in &results {
        assert_eq!(
            result.logs.len(),
            1,
            "task {} leaked logs from {} attempts",
            result.index,
            result.attempts
        );
    }
}

#[test]
fn cancellation_leaves_an_in_order_prefix() {
    let num_txns = 6;
    let txs: Vec<SimTx> = (0..num_txns)
        .map(|i| SimTx {
            origin: Address::repeat_byte(i as u8 + 1),
            increments: vec![counter_key(i as u8)],
        })
        .collect();

    let store = InMemoryStore::new();
    let cancel = CancellationToken::new();
    let executor = ParallelExecutor::new(ExecutorConfig {
        num_threads: 2,
        ..Default::default()
    });

    let err = executor
        .execute_batch(&txs, &store, BlockInfo::default(), cancel.clone(), {
            let cancel = cancel.clone();
            move |tx: &SimTx, env: &mut AttemptEnv<'_, InMemoryStore>| {
                if env.index() == 3 {
                    cancel.cancel();
                    return Err(ExecutionError::Aborted { index: 3 });
                }
                run_increments(tx, env)
            }
        })
        .unwrap_err();

    let BatchError::Cancelled { committed } = err else {
        panic!("expected cancellation, got {err:?}");
    };
    assert!(committed < num_txns);
    // committed effects form an exact index prefix
    for i in 0..num_txns {
        let present = store.get(&counter_key(i as u8)).is_some();
        assert_eq!(present, i < committed, "gap at index {i}");
    }
}
