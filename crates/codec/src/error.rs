//! Codec error type.

use thiserror::Error;

/// Errors that can occur while decoding reference-chain payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The payload ended before a field could be read.
    #[error("payload truncated at offset {offset}, needed {needed} more bytes")]
    Truncated {
        /// Offset the read started at.
        offset: usize,
        /// Bytes missing.
        needed: usize,
    },

    /// The payload is shorter than the 4-byte method selector.
    #[error("payload shorter than method selector")]
    MissingSelector,

    /// A declared value exceeds the supported 128-bit range.
    #[error("value word exceeds 128 bits")]
    ValueOverflow,

    /// Unknown transaction kind tag.
    #[error("unknown transaction kind tag {0}")]
    UnknownTxKind(u64),
}
