//! Tracking of locally mined blocks until they mature.

use shardline_chain::BlockChain;
use shardline_types::{BlockHeight, Hash};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// Ring of locally mined blocks awaiting canonicalness confirmation.
///
/// A block is checked against the canonical chain once the head is `depth`
/// blocks past it, then reported as canonical, a side fork, or lost.
pub struct UnconfirmedBlocks {
    chain: Arc<BlockChain>,
    depth: u64,
    blocks: VecDeque<(BlockHeight, Hash)>,
}

impl UnconfirmedBlocks {
    /// Track blocks until they are `depth` deep.
    pub fn new(chain: Arc<BlockChain>, depth: u64) -> Self {
        Self {
            chain,
            depth,
            blocks: VecDeque::new(),
        }
    }

    /// Add a newly mined block, first shifting out everything mature
    /// relative to it.
    pub fn insert(&mut self, number: BlockHeight, hash: Hash) {
        self.shift(BlockHeight(number.0.saturating_sub(self.depth)));
        self.blocks.push_back((number, hash));
    }

    /// Report and drop every tracked block at or below `height`.
    pub fn shift(&mut self, height: BlockHeight) {
        while let Some(&(number, hash)) = self.blocks.front() {
            if number > height {
                break;
            }
            self.blocks.pop_front();

            match self.chain.get_block_by_number(number) {
                Some(canonical) if canonical.hash() == hash => {
                    info!(number = number.0, %hash, "🔗 block reached canonical chain");
                }
                Some(_) => {
                    if self.chain.get_block(&hash).is_some() {
                        info!(number = number.0, %hash, "⑂ block became a side fork");
                    } else {
                        warn!(number = number.0, %hash, "😱 block lost");
                    }
                }
                None => {
                    warn!(number = number.0, %hash, "😱 block lost");
                }
            }
        }
    }

    /// Number of blocks still tracked.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
