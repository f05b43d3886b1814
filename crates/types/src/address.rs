//! Account and contract addresses.

use crate::{Hash, ShardId};
use sbor::prelude::*;
use std::fmt;

/// Fixed seed from which the per-shard commit addresses are derived.
const SHARD_ADDRESS_SEED: [u8; 20] = [
    0x64, 0x62, 0xc7, 0x3a, 0x8d, 0x49, 0x13, 0x91, 0x0c, 0x5a, 0xaa, 0x74, 0x8e, 0xa8, 0x2c,
    0xd6, 0x7e, 0xb4, 0xb7, 0x3d,
];

/// A 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Size of address in bytes.
    pub const BYTES: usize = 20;

    /// Zero address.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Create an Address from a byte slice.
    ///
    /// # Panics
    ///
    /// Panics if bytes length is not exactly 20.
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), 20, "Address must be exactly 20 bytes");
        let mut arr = [0u8; 20];
        arr.copy_from_slice(bytes);
        Self(arr)
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Check if this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the contract address created by `(sender, nonce)`.
    pub fn of_contract(sender: &Address, nonce: u64) -> Self {
        let hash = Hash::from_parts(&[sender.as_bytes(), &nonce.to_be_bytes()]);
        Self::from_slice(&hash.as_bytes()[12..])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The well-known address of the reference shard's coordination contract.
pub fn reference_address() -> Address {
    shard_address(ShardId(0))
}

/// The unique commit address of each shard.
///
/// Derived by adding the shard id to the fixed 20-byte seed, treating the
/// seed as a big-endian integer.
pub fn shard_address(shard: ShardId) -> Address {
    let mut bytes = SHARD_ADDRESS_SEED;
    let mut carry = shard.0;
    for byte in bytes.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u64 + (carry & 0xff);
        *byte = (sum & 0xff) as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    Address(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_addresses_distinct() {
        let a0 = shard_address(ShardId(0));
        let a1 = shard_address(ShardId(1));
        let a2 = shard_address(ShardId(2));
        assert_ne!(a0, a1);
        assert_ne!(a1, a2);
        assert_eq!(a0, reference_address());
    }

    #[test]
    fn test_shard_address_is_seed_plus_shard() {
        let a0 = shard_address(ShardId(0));
        let a5 = shard_address(ShardId(5));
        assert_eq!(a0.0[19] + 5, a5.0[19]);
        assert_eq!(&a0.0[..19], &a5.0[..19]);
    }

    #[test]
    fn test_contract_address_depends_on_nonce() {
        let sender = Address([7u8; 20]);
        assert_ne!(
            Address::of_contract(&sender, 0),
            Address::of_contract(&sender, 1)
        );
    }
}
