//! Account state and gas accounting for block execution.

mod gas;
mod statedb;

pub use gas::{intrinsic_gas, GasLimitReached, GasPool, TX_GAS, TX_GAS_CONTRACT_CREATION};
pub use statedb::{Account, Snapshot, StateDb, StateError};
