//! Per-attempt cache of loaded contract instances.
//!
//! Entering an inter-contract call pushes a frame; a reentrant (cyclic) call
//! into a contract that is already on the stack reuses the existing instance
//! instead of loading a second copy, so call cycles observe one shared
//! instance state. The stack is scoped to a single attempt and discarded
//! wholesale on reset or commit.

use alloy_primitives::{Address, B256};
use std::sync::Arc;

/// A contract instance loaded during the current attempt.
///
/// The instance is opaque to the coordinator: it exists so reentrant calls
/// can be routed back to the same loaded copy. Identity (which `Arc` you
/// hold) is the contract here, hence no `Clone`.
#[derive(Debug)]
pub struct ContractInstance {
    address: Address,
    code_hash: B256,
}

impl ContractInstance {
    pub fn new(address: Address, code_hash: B256) -> Self {
        Self { address, code_hash }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn code_hash(&self) -> B256 {
        self.code_hash
    }
}

/// Stack of contract instances loaded by the current attempt, innermost last.
#[derive(Debug, Default)]
pub struct ReentrantStack {
    frames: Vec<Arc<ContractInstance>>,
}

impl ReentrantStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topmost already-loaded instance for `address`, if the current call
    /// chain already passed through that contract.
    pub fn find(&self, address: Address) -> Option<Arc<ContractInstance>> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.address() == address)
            .cloned()
    }

    pub fn push(&mut self, instance: Arc<ContractInstance>) {
        self.frames.push(instance);
    }

    pub fn pop(&mut self) -> Option<Arc<ContractInstance>> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
