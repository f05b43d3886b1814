//! Block gas accounting.

use thiserror::Error;

/// Gas charged for any transaction.
pub const TX_GAS: u64 = 21_000;

/// Gas charged for contract-creating transactions.
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;

/// The block gas pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gas limit reached")]
pub struct GasLimitReached;

/// Tracks the gas available to the transactions of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    /// Create a pool with the block gas limit.
    pub fn new(limit: u64) -> Self {
        Self(limit)
    }

    /// Remaining gas.
    pub fn gas(&self) -> u64 {
        self.0
    }

    /// Return gas to the pool.
    pub fn add(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    /// Take gas from the pool.
    pub fn sub(&mut self, amount: u64) -> Result<(), GasLimitReached> {
        if self.0 < amount {
            return Err(GasLimitReached);
        }
        self.0 -= amount;
        Ok(())
    }
}

/// Intrinsic gas of a transaction before any execution.
pub fn intrinsic_gas(is_contract_creation: bool, payload: &[u8]) -> u64 {
    let base = if is_contract_creation {
        TX_GAS_CONTRACT_CREATION
    } else {
        TX_GAS
    };
    // 4 gas per zero byte, 68 per nonzero, as the external VM charges.
    let data: u64 = payload
        .iter()
        .map(|&b| if b == 0 { 4u64 } else { 68u64 })
        .sum();
    base + data
}
