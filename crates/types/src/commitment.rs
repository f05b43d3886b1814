//! Shard state commitments.

use crate::{BlockHeight, Hash, ShardId};
use sbor::prelude::*;
use std::collections::BTreeMap;

/// A worker shard's published snapshot: which of its blocks is committed,
/// against which reference height, with which state root.
///
/// The latest commit per shard is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct Commitment {
    /// Shard that published the commitment.
    pub shard: ShardId,

    /// Committed shard-local block height.
    pub block_num: BlockHeight,

    /// Reference height the committed block reports.
    pub ref_num: BlockHeight,

    /// Public state root of the committed block.
    pub state_root: Hash,

    /// Hash of the committed block.
    pub block_hash: Hash,
}

impl Commitment {
    /// A genesis commitment for a shard.
    pub fn genesis(shard: ShardId, state_root: Hash, block_hash: Hash) -> Self {
        Self {
            shard,
            block_num: BlockHeight::GENESIS,
            ref_num: BlockHeight::GENESIS,
            state_root,
            block_hash,
        }
    }

    /// Replace the mutable contents in place.
    pub fn update(
        &mut self,
        block_num: BlockHeight,
        ref_num: BlockHeight,
        state_root: Hash,
        block_hash: Hash,
    ) {
        self.block_num = block_num;
        self.ref_num = ref_num;
        self.state_root = state_root;
        self.block_hash = block_hash;
    }
}

/// The commitments known at one reference height, per shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitmentMap {
    commits: BTreeMap<ShardId, Commitment>,
}

impl CommitmentMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the commitment of a shard, replacing any previous entry.
    pub fn add(&mut self, shard: ShardId, commit: Commitment) {
        self.commits.insert(shard, commit);
    }

    /// Get the commitment of a shard.
    pub fn get(&self, shard: ShardId) -> Option<&Commitment> {
        self.commits.get(&shard)
    }

    /// Committed block height of a shard, genesis when unknown.
    pub fn commit_num(&self, shard: ShardId) -> BlockHeight {
        self.commits
            .get(&shard)
            .map(|c| c.block_num)
            .unwrap_or(BlockHeight::GENESIS)
    }

    /// Carry every worker shard's commitment forward from a previous height.
    pub fn copy_from(&mut self, num_shards: u64, prev: &CommitmentMap) {
        for shard in 1..num_shards {
            let shard = ShardId(shard);
            if let Some(commit) = prev.get(shard) {
                self.commits.insert(shard, *commit);
            }
        }
    }

    /// Number of shards with a known commitment.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Whether no commitment is known.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}
