use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid unsigned byte width {0}, must be between 1 and 8")]
    InvalidWidth(usize),

    #[error("value {value} does not fit in {width} unsigned byte(s)")]
    ValueOutOfRange { value: u64, width: usize },

    /// Incrementing the highest UID would leave the 4-byte space.
    #[error("UID space exhausted, cannot allocate beyond {0}")]
    UidOverflow(u32),

    #[error("invalid key range [{from}, {to}): from must be less than to")]
    InvalidRange { from: i64, to: i64 },

    #[error("unknown processing state id {0}")]
    UnknownProcessingState(u8),

    #[error("serialization error: {0}")]
    Serialization(String),
}
