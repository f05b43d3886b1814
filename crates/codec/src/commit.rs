//! State-commit payload codec.
//!
//! A state-commit transaction carries, after the 4-byte method selector,
//! five 32-byte big-endian words: shard, committed block height, reported
//! reference height, state root, block hash.

use crate::CodecError;
use shardline_types::{BlockHeight, Commitment, Hash, ShardId};

const WORD: usize = 32;
const SELECTOR: usize = 4;
const PAYLOAD_LEN: usize = SELECTOR + 5 * WORD;

fn word_u64(data: &[u8], index: usize) -> u64 {
    let start = index * WORD + 24;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&data[start..start + 8]);
    u64::from_be_bytes(arr)
}

/// Decode a state-commit payload into its commitment.
pub fn decode_state_commit(payload: &[u8]) -> Result<Commitment, CodecError> {
    if payload.len() < PAYLOAD_LEN {
        return Err(CodecError::Truncated {
            offset: payload.len(),
            needed: PAYLOAD_LEN - payload.len(),
        });
    }
    let data = &payload[SELECTOR..];

    Ok(Commitment {
        shard: ShardId(word_u64(data, 0)),
        block_num: BlockHeight(word_u64(data, 1)),
        ref_num: BlockHeight(word_u64(data, 2)),
        state_root: Hash::from_hash_bytes(&data[3 * WORD..4 * WORD]),
        block_hash: Hash::from_hash_bytes(&data[4 * WORD..5 * WORD]),
    })
}

/// Encode a commitment as a state-commit payload.
pub fn encode_state_commit(commit: &Commitment) -> Vec<u8> {
    let mut out = vec![0u8; PAYLOAD_LEN];
    out[SELECTOR + 24..SELECTOR + 32].copy_from_slice(&commit.shard.0.to_be_bytes());
    out[SELECTOR + WORD + 24..SELECTOR + 2 * WORD]
        .copy_from_slice(&commit.block_num.0.to_be_bytes());
    out[SELECTOR + 2 * WORD + 24..SELECTOR + 3 * WORD]
        .copy_from_slice(&commit.ref_num.0.to_be_bytes());
    out[SELECTOR + 3 * WORD..SELECTOR + 4 * WORD].copy_from_slice(commit.state_root.as_bytes());
    out[SELECTOR + 4 * WORD..SELECTOR + 5 * WORD].copy_from_slice(commit.block_hash.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_commit_roundtrip() {
        let commit = Commitment {
            shard: ShardId(2),
            block_num: BlockHeight(9),
            ref_num: BlockHeight(5),
            state_root: Hash::from_bytes(b"root"),
            block_hash: Hash::from_bytes(b"hash"),
        };

        let encoded = encode_state_commit(&commit);
        assert_eq!(encoded.len(), PAYLOAD_LEN);
        let decoded = decode_state_commit(&encoded).unwrap();
        assert_eq!(decoded, commit);
    }

    #[test]
    fn test_short_payload_rejected() {
        let commit = Commitment {
            shard: ShardId(1),
            block_num: BlockHeight(1),
            ref_num: BlockHeight(1),
            state_root: Hash::ZERO,
            block_hash: Hash::ZERO,
        };
        let encoded = encode_state_commit(&commit);
        assert!(decode_state_commit(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_state_commit(&[]).is_err());
    }
}
