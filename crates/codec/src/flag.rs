//! Receipt-log success flag.
//!
//! Cross-shard and state-commit contracts emit an event whose first
//! 32-byte word carries an applied flag in its low 8 bytes: `1` means the
//! call took effect.

use shardline_types::Receipt;

const WORD: usize = 32;
const FLAG_OFFSET: usize = 24;

/// Read the applied flag from raw event data.
pub fn event_applied(data: &[u8]) -> bool {
    if data.len() < WORD {
        return false;
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&data[FLAG_OFFSET..WORD]);
    u64::from_be_bytes(arr) == 1
}

/// Whether a receipt reports a successfully applied cross-shard or
/// state-commit call: the transaction succeeded and its first log carries
/// the applied flag.
pub fn receipt_applied(receipt: &Receipt) -> bool {
    receipt.success
        && receipt
            .logs
            .first()
            .map(|log| event_applied(&log.data))
            .unwrap_or(false)
}

/// Build event data carrying the applied flag, for tests and the dev
/// engine's synthetic receipts.
pub fn applied_event_data(applied: bool) -> Vec<u8> {
    let mut data = vec![0u8; WORD];
    data[WORD - 1] = u8::from(applied);
    data
}
