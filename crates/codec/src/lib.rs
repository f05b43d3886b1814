//! Pure decoders for reference-chain payloads.
//!
//! Three payload shapes flow through the reference chain: cross-shard
//! transaction declarations, state commitments, and the receipt-log flag
//! both report through. The decoders are stateless and panic-free on
//! arbitrary input; encoders exist as their tested inverses.

mod commit;
mod cross;
mod error;
mod flag;

pub use commit::{decode_state_commit, encode_state_commit};
pub use cross::{
    decode_cross_payload, decode_cross_rw_sets, decode_cross_shards, encode_cross_payload,
    CrossPayload,
};
pub use error::CodecError;
pub use flag::{applied_event_data, event_applied, receipt_applied};
