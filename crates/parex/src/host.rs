//! Host API boundary seen by executed contract code.
//!
//! The coordinator does not implement these operations; it provides the
//! call-depth and reentrancy bookkeeping a nested call must update, the
//! output buffer `println` feeds, and the abort checkpoints every state
//! access passes through. The sandboxed interpreter implements this trait
//! on top of those primitives.

use alloy_primitives::{Address, Bytes, B256, U256};

use crate::types::TxnIndex;

/// Metadata of the transaction an attempt is executing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionInfo {
    pub hash: B256,
    pub index: TxnIndex,
    pub nonce: u64,
    pub timestamp: u64,
    /// Value transferred along with the entry call.
    pub value: U256,
}

/// Metadata of the block the batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub height: u64,
    pub timestamp: u64,
}

/// Failure surfaced to executed code through the host boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// Contract-initiated rollback of its own attempt. A deliberate, normal
    /// outcome, distinct from engine-initiated abort.
    #[error("reverted with code {code}")]
    Revert { code: u32, message: Option<String> },
    /// Engine-initiated cancellation observed at a host call.
    #[error("attempt aborted")]
    Aborted,
    /// Nested call rejected because the depth guard tripped.
    #[error("call depth limit {max} exceeded")]
    DepthLimit { max: u32 },
}

impl HostError {
    pub fn revert(code: u32) -> Self {
        HostError::Revert {
            code,
            message: None,
        }
    }

    pub fn revert_with(code: u32, message: impl Into<String>) -> Self {
        HostError::Revert {
            code,
            message: Some(message.into()),
        }
    }
}

/// Revert code used by a failed [`HostApi::require`].
pub const REVERT_REQUIRE_FAILED: u32 = 1;

/// Revert code reported when a nested call trips the depth guard.
pub const REVERT_CALL_DEPTH_EXCEEDED: u32 = 2;

/// Operations executed contract code may perform during `Running`.
pub trait HostApi {
    /// Metadata of the origin transaction.
    fn transaction(&self) -> &TransactionInfo;

    /// Metadata of the enclosing block.
    fn block(&self) -> &BlockInfo;

    /// Address of the currently running contract.
    fn self_address(&self) -> Address;

    /// Immediate caller (the previous frame, or the origin account).
    fn caller(&self) -> Address;

    /// Originating external account of the whole transaction chain.
    fn origin(&self) -> Option<Address>;

    /// Balance of an account.
    fn balance(&mut self, address: Address) -> Result<U256, HostError>;

    /// Synchronous nested call into another contract. Recurses through the
    /// task's call-depth and reentrancy bookkeeping.
    fn call(
        &mut self,
        target: Address,
        method: &str,
        params: &[Bytes],
        value: U256,
    ) -> Result<Option<Bytes>, HostError>;

    /// Emit an event log entry with indexed topics and a data payload.
    fn emit_log(&mut self, indexed: Vec<Bytes>, data: Vec<Bytes>) -> Result<(), HostError>;

    /// Append a line to the attempt's diagnostic output buffer.
    fn println(&mut self, message: &str) -> Result<(), HostError>;

    /// Roll back the current attempt with a status code and message.
    fn revert(&mut self, code: u32, message: Option<String>) -> HostError {
        HostError::Revert { code, message }
    }

    /// Revert unless `condition` holds.
    fn require(&mut self, condition: bool) -> Result<(), HostError> {
        if condition {
            Ok(())
        } else {
            Err(HostError::revert(REVERT_REQUIRE_FAILED))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockHost {
        tx: TransactionInfo,
        block: BlockInfo,
        lines: Vec<String>,
    }

    impl HostApi for MockHost {
        fn transaction(&self) -> &TransactionInfo {
            &self.tx
        }

        fn block(&self) -> &BlockInfo {
            &self.block
        }

        fn self_address(&self) -> Address {
            Address::repeat_byte(0x01)
        }

        fn caller(&self) -> Address {
            Address::repeat_byte(0x02)
        }

        fn origin(&self) -> Option<Address> {
            Some(Address::repeat_byte(0x02))
        }

        fn balance(&mut self, _address: Address) -> Result<U256, HostError> {
            Ok(U256::from(100u64))
        }

        fn call(
            &mut self,
            _target: Address,
            _method: &str,
            _params: &[Bytes],
            _value: U256,
        ) -> Result<Option<Bytes>, HostError> {
            Err(HostError::DepthLimit { max: 0 })
        }

        fn emit_log(&mut self, _indexed: Vec<Bytes>, _data: Vec<Bytes>) -> Result<(), HostError> {
            Ok(())
        }

        fn println(&mut self, message: &str) -> Result<(), HostError> {
            self.lines.push(message.to_string());
            Ok(())
        }
    }

    fn host() -> MockHost {
        MockHost {
            tx: TransactionInfo::default(),
            block: BlockInfo {
                height: 42,
                timestamp: 1_700_000_000,
            },
            lines: Vec::new(),
        }
    }

    #[test]
    fn require_reverts_on_false() {
        let mut h = host();
        assert!(h.require(true).is_ok());
        assert_eq!(
            h.require(false),
            Err(HostError::revert(REVERT_REQUIRE_FAILED))
        );
    }

    #[test]
    fn revert_carries_code_and_message() {
        let mut h = host();
        let err = h.revert(7, Some("insufficient funds".into()));
        assert_eq!(
            err,
            HostError::Revert {
                code: 7,
                message: Some("insufficient funds".into())
            }
        );
    }

    #[test]
    fn metadata_is_reachable_through_the_trait() {
        let h = host();
        assert_eq!(h.block().height, 42);
        assert_eq!(h.transaction().nonce, 0);
    }
}
