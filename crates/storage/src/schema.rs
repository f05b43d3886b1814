//! Typed chain schema over the raw key-value store.
//!
//! Keys are short prefixes plus hashes or big-endian numbers; values are
//! sbor-encoded. Besides the usual chain tables this system stores the
//! private state root per public root and a per-block private bloom.

use crate::{KeyValue, StorageError};
use sbor::prelude::*;
use shardline_types::{Block, BlockHeight, Body, Hash, Header, Receipt};

/// Schema version. An incompatible database forces a full resync.
pub const CHAIN_VERSION: u64 = 3;

const HEADER_PREFIX: u8 = b'h';
const BODY_PREFIX: u8 = b'b';
const RECEIPTS_PREFIX: u8 = b'r';
const TD_PREFIX: u8 = b't';
const NUMBER_PREFIX: u8 = b'n';
const CANONICAL_PREFIX: u8 = b'c';
const PRIVATE_ROOT_PREFIX: &[u8] = b"ps";
const PRIVATE_BLOOM_PREFIX: &[u8] = b"pb";
const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
const HEAD_FAST_KEY: &[u8] = b"LastFast";
const VERSION_KEY: &[u8] = b"ChainVersion";

fn hash_key(prefix: u8, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Hash::BYTES);
    key.push(prefix);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn number_key(prefix: u8, number: BlockHeight) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&number.0.to_be_bytes());
    key
}

fn decode<T: BasicDecode>(bytes: Vec<u8>) -> Result<T, StorageError> {
    basic_decode(&bytes).map_err(|e| StorageError::Corrupt(format!("{:?}", e)))
}

fn encode<T: BasicEncode>(value: &T) -> Vec<u8> {
    basic_encode(value).expect("schema value serialization should never fail")
}

/// Read the schema version tag.
pub fn read_chain_version(db: &dyn KeyValue) -> Result<Option<u64>, StorageError> {
    db.get(VERSION_KEY).map(decode).transpose()
}

/// Write the schema version tag.
pub fn write_chain_version(db: &dyn KeyValue, version: u64) {
    db.put(VERSION_KEY, &encode(&version));
}

/// Read a header by hash.
pub fn read_header(db: &dyn KeyValue, hash: &Hash) -> Result<Option<Header>, StorageError> {
    db.get(&hash_key(HEADER_PREFIX, hash)).map(decode).transpose()
}

/// Read a body by hash.
pub fn read_body(db: &dyn KeyValue, hash: &Hash) -> Result<Option<Body>, StorageError> {
    db.get(&hash_key(BODY_PREFIX, hash)).map(decode).transpose()
}

/// Whether a body exists.
pub fn has_body(db: &dyn KeyValue, hash: &Hash) -> bool {
    db.has(&hash_key(BODY_PREFIX, hash))
}

/// Delete a body.
pub fn delete_body(db: &dyn KeyValue, hash: &Hash) {
    db.delete(&hash_key(BODY_PREFIX, hash));
}

/// Write a block's header, body and number lookup.
pub fn write_block(db: &dyn KeyValue, block: &Block) {
    let hash = block.hash();
    db.put(&hash_key(HEADER_PREFIX, &hash), &encode(&block.header));
    db.put(
        &hash_key(BODY_PREFIX, &hash),
        &encode(&Body {
            transactions: block.transactions.clone(),
        }),
    );
    db.put(&hash_key(NUMBER_PREFIX, &hash), &encode(&block.number().0));
}

/// Read a full block by hash.
pub fn read_block(db: &dyn KeyValue, hash: &Hash) -> Result<Option<Block>, StorageError> {
    let Some(header) = read_header(db, hash)? else {
        return Ok(None);
    };
    let Some(body) = read_body(db, hash)? else {
        return Ok(None);
    };
    Ok(Some(Block::new(header, body.transactions)))
}

/// Read the height a hash lives at.
pub fn read_block_number(db: &dyn KeyValue, hash: &Hash) -> Result<Option<BlockHeight>, StorageError> {
    Ok(db
        .get(&hash_key(NUMBER_PREFIX, hash))
        .map(decode::<u64>)
        .transpose()?
        .map(BlockHeight))
}

/// Read the receipts of a block.
pub fn read_receipts(db: &dyn KeyValue, hash: &Hash) -> Result<Option<Vec<Receipt>>, StorageError> {
    db.get(&hash_key(RECEIPTS_PREFIX, hash)).map(decode).transpose()
}

/// Write the receipts of a block.
pub fn write_receipts(db: &dyn KeyValue, hash: &Hash, receipts: &[Receipt]) {
    db.put(&hash_key(RECEIPTS_PREFIX, hash), &encode(&receipts.to_vec()));
}

/// Read a block's total difficulty.
pub fn read_td(db: &dyn KeyValue, hash: &Hash) -> Result<Option<u64>, StorageError> {
    db.get(&hash_key(TD_PREFIX, hash)).map(decode).transpose()
}

/// Write a block's total difficulty.
pub fn write_td(db: &dyn KeyValue, hash: &Hash, td: u64) {
    db.put(&hash_key(TD_PREFIX, hash), &encode(&td));
}

/// Read the canonical hash at a height.
pub fn read_canonical_hash(db: &dyn KeyValue, number: BlockHeight) -> Result<Option<Hash>, StorageError> {
    db.get(&number_key(CANONICAL_PREFIX, number)).map(decode).transpose()
}

/// Assign the canonical hash at a height.
pub fn write_canonical_hash(db: &dyn KeyValue, hash: &Hash, number: BlockHeight) {
    db.put(&number_key(CANONICAL_PREFIX, number), &encode(hash));
}

/// Remove the canonical assignment at a height.
pub fn delete_canonical_hash(db: &dyn KeyValue, number: BlockHeight) {
    db.delete(&number_key(CANONICAL_PREFIX, number));
}

/// Read the head block hash.
pub fn read_head_block_hash(db: &dyn KeyValue) -> Result<Option<Hash>, StorageError> {
    db.get(HEAD_BLOCK_KEY).map(decode).transpose()
}

/// Write the head block hash.
pub fn write_head_block_hash(db: &dyn KeyValue, hash: &Hash) {
    db.put(HEAD_BLOCK_KEY, &encode(hash));
}

/// Read the head header hash.
pub fn read_head_header_hash(db: &dyn KeyValue) -> Result<Option<Hash>, StorageError> {
    db.get(HEAD_HEADER_KEY).map(decode).transpose()
}

/// Write the head header hash.
pub fn write_head_header_hash(db: &dyn KeyValue, hash: &Hash) {
    db.put(HEAD_HEADER_KEY, &encode(hash));
}

/// Read the fast-sync head hash.
pub fn read_head_fast_hash(db: &dyn KeyValue) -> Result<Option<Hash>, StorageError> {
    db.get(HEAD_FAST_KEY).map(decode).transpose()
}

/// Write the fast-sync head hash.
pub fn write_head_fast_hash(db: &dyn KeyValue, hash: &Hash) {
    db.put(HEAD_FAST_KEY, &encode(hash));
}

fn private_root_key(public_root: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(PRIVATE_ROOT_PREFIX.len() + Hash::BYTES);
    key.extend_from_slice(PRIVATE_ROOT_PREFIX);
    key.extend_from_slice(public_root.as_bytes());
    key
}

/// Read the private state root recorded for a public root.
pub fn read_private_state_root(
    db: &dyn KeyValue,
    public_root: &Hash,
) -> Result<Option<Hash>, StorageError> {
    db.get(&private_root_key(public_root)).map(decode).transpose()
}

/// Record the private state root for a public root.
pub fn write_private_state_root(db: &dyn KeyValue, public_root: &Hash, private_root: &Hash) {
    db.put(&private_root_key(public_root), &encode(private_root));
}

fn private_bloom_key(number: BlockHeight) -> Vec<u8> {
    let mut key = Vec::with_capacity(PRIVATE_BLOOM_PREFIX.len() + 8);
    key.extend_from_slice(PRIVATE_BLOOM_PREFIX);
    key.extend_from_slice(&number.0.to_be_bytes());
    key
}

/// Read the private bloom of a block.
pub fn read_private_bloom(db: &dyn KeyValue, number: BlockHeight) -> Result<Option<Vec<u8>>, StorageError> {
    db.get(&private_bloom_key(number)).map(decode).transpose()
}

/// Write the private bloom of a block.
pub fn write_private_bloom(db: &dyn KeyValue, number: BlockHeight, bloom: &[u8]) {
    db.put(&private_bloom_key(number), &encode(&bloom.to_vec()));
}
