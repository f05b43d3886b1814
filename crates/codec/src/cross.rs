//! Cross-shard transaction payload codec.
//!
//! # Wire format
//!
//! A reference-chain cross-shard transaction carries, after the 4-byte
//! method selector, an ABI-shaped envelope:
//!
//! ```text
//! word 0   offset of the shard array (0x40)
//! word 1   offset of the packed body
//! word 2   shard count n
//! n words  shard ids (low 8 bytes each)
//! word     body length
//! body     packed cross-shard body
//! ```
//!
//! The packed body is byte-oriented, big-endian:
//!
//! ```text
//! u16 num_shards
//! per shard: u16 shard, u16 num_contracts,
//!            per contract: addr(20), u16 num_keys,
//!                          per key: hash(32), u8 write_flag
//! sender(20) nonce(8) value(32) receiver(20) gas_limit(8) gas_price(8)
//! inner_data...
//! ```

use crate::CodecError;
use shardline_types::{Address, ContractRwSet, Hash, ShardId, ShardRwSets, Transaction};

const WORD: usize = 32;
const SELECTOR: usize = 4;

/// A decoded cross-shard payload: participant shards, their declared
/// read/write sets, and the derived local-execution transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossPayload {
    /// Participant shards in declaration order.
    pub shards: Vec<ShardId>,

    /// Declared read/write sets per shard.
    pub rw_sets: ShardRwSets,

    /// The derived cross-shard-local transaction.
    pub inner: Transaction,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() - self.pos < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n - (self.data.len() - self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read a 32-byte word whose low 8 bytes hold a u64.
    fn read_word_u64(&mut self) -> Result<u64, CodecError> {
        let word = self.take(WORD)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&word[24..]);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read a 32-byte value word into a u128.
    fn read_value(&mut self) -> Result<u128, CodecError> {
        let word = self.take(WORD)?;
        if word[..16].iter().any(|&b| b != 0) {
            return Err(CodecError::ValueOverflow);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(arr))
    }

    fn read_address(&mut self) -> Result<Address, CodecError> {
        Ok(Address::from_slice(self.take(Address::BYTES)?))
    }

    fn read_hash(&mut self) -> Result<Hash, CodecError> {
        Ok(Hash::from_hash_bytes(self.take(Hash::BYTES)?))
    }

    fn rest(self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

fn strip_selector(payload: &[u8]) -> Result<&[u8], CodecError> {
    if payload.len() < SELECTOR {
        return Err(CodecError::MissingSelector);
    }
    Ok(&payload[SELECTOR..])
}

/// Decode only the participant shard list from a cross-shard payload.
///
/// Cheap scan used to decide whether a reference block touches this shard
/// before paying for the full body decode.
pub fn decode_cross_shards(payload: &[u8]) -> Result<Vec<ShardId>, CodecError> {
    let mut reader = Reader::new(strip_selector(payload)?);
    reader.take(2 * WORD)?; // head offsets
    let count = reader.read_word_u64()?;
    let mut shards = Vec::with_capacity(count as usize);
    for _ in 0..count {
        shards.push(ShardId(reader.read_word_u64()?));
    }
    Ok(shards)
}

fn read_rw_sets(
    reader: &mut Reader<'_>,
    num_shards: u16,
) -> Result<(Vec<ShardId>, ShardRwSets), CodecError> {
    let mut shards = Vec::with_capacity(num_shards as usize);
    let mut rw_sets = ShardRwSets::new();

    for _ in 0..num_shards {
        let shard = ShardId(reader.read_u16()? as u64);
        let num_contracts = reader.read_u16()?;
        let mut sets = Vec::with_capacity(num_contracts as usize);

        for _ in 0..num_contracts {
            let addr = reader.read_address()?;
            let num_keys = reader.read_u16()?;
            let mut set = ContractRwSet::new(addr);
            for _ in 0..num_keys {
                let key = reader.read_hash()?;
                let is_write = reader.read_u8()? == 1;
                set.add_read(key);
                if is_write {
                    set.add_write(key);
                }
            }
            sets.push(set);
        }

        shards.push(shard);
        rw_sets.insert(shard, sets);
    }

    Ok((shards, rw_sets))
}

fn write_rw_sets(out: &mut Vec<u8>, shards: &[ShardId], rw_sets: &ShardRwSets) {
    out.extend_from_slice(&(shards.len() as u16).to_be_bytes());
    for shard in shards {
        out.extend_from_slice(&(shard.0 as u16).to_be_bytes());
        let sets = rw_sets.get(shard).map(Vec::as_slice).unwrap_or(&[]);
        out.extend_from_slice(&(sets.len() as u16).to_be_bytes());
        for set in sets {
            out.extend_from_slice(set.addr.as_bytes());
            out.extend_from_slice(&(set.reads.len() as u16).to_be_bytes());
            for key in &set.reads {
                out.extend_from_slice(key.as_bytes());
                out.push(u8::from(set.writes.contains(key)));
            }
        }
    }
}

/// Fully decode a cross-shard payload into shards, read/write sets and the
/// derived local-execution transaction.
pub fn decode_cross_payload(payload: &[u8]) -> Result<CrossPayload, CodecError> {
    let data = strip_selector(payload)?;
    let mut reader = Reader::new(data);
    reader.take(2 * WORD)?; // head offsets
    let count = reader.read_word_u64()?;
    reader.take(count as usize * WORD)?; // shard words, repeated in the body
    reader.take(WORD)?; // body length word

    let num_shards = reader.read_u16()?;
    let (shards, rw_sets) = read_rw_sets(&mut reader, num_shards)?;

    let sender = reader.read_address()?;
    let nonce = reader.read_u64()?;
    let value = reader.read_value()?;
    let receiver = reader.read_address()?;
    let gas_limit = reader.read_u64()?;
    let gas_price = reader.read_u64()?;
    let inner_data = reader.rest().to_vec();

    let inner = Transaction::cross_local(
        nonce, receiver, sender, value, gas_limit, gas_price, inner_data,
    );

    Ok(CrossPayload {
        shards,
        rw_sets,
        inner,
    })
}

/// Decode only the read/write sets of a cross-shard payload.
pub fn decode_cross_rw_sets(payload: &[u8]) -> Result<ShardRwSets, CodecError> {
    Ok(decode_cross_payload(payload)?.rw_sets)
}

fn push_word_u64(out: &mut Vec<u8>, value: u64) {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    out.extend_from_slice(&word);
}

/// Encode a cross-shard payload, the inverse of [`decode_cross_payload`].
pub fn encode_cross_payload(payload: &CrossPayload) -> Vec<u8> {
    let mut body = Vec::new();
    write_rw_sets(&mut body, &payload.shards, &payload.rw_sets);
    body.extend_from_slice(payload.inner.from().as_bytes());
    body.extend_from_slice(&payload.inner.nonce.to_be_bytes());
    let mut value_word = [0u8; WORD];
    value_word[16..].copy_from_slice(&payload.inner.value.to_be_bytes());
    body.extend_from_slice(&value_word);
    body.extend_from_slice(
        payload
            .inner
            .to
            .unwrap_or(Address::ZERO)
            .as_bytes(),
    );
    body.extend_from_slice(&payload.inner.gas_limit.to_be_bytes());
    body.extend_from_slice(&payload.inner.gas_price.to_be_bytes());
    body.extend_from_slice(&payload.inner.payload);

    let n = payload.shards.len();
    let mut out = vec![0u8; SELECTOR];
    push_word_u64(&mut out, 0x40);
    push_word_u64(&mut out, 0x60 + (n as u64) * WORD as u64);
    push_word_u64(&mut out, n as u64);
    for shard in &payload.shards {
        push_word_u64(&mut out, shard.0);
    }
    push_word_u64(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}
