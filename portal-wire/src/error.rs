use thiserror::Error;

/// Errors produced while encoding or decoding wire-level values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Truncated input: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    #[error("Unknown message selector {0:#04x}")]
    UnknownSelector(u8),
    #[error("Unknown content key selector {0:#04x}")]
    UnknownContentType(u8),
    #[error("SSZ decode error: {0}")]
    Ssz(String),
    #[error("List length {len} exceeds limit {limit}")]
    ListTooLong { len: usize, limit: usize },
    #[error("Invalid ENR: {0}")]
    InvalidEnr(String),
    #[error("Invalid ENR signature")]
    BadEnrSignature,
    #[error("Trailing bytes after message body")]
    TrailingBytes,
}

impl WireError {
    /// Maps decoder failures onto the wire taxonomy: bad union selectors
    /// stay distinguishable from structural damage.
    pub fn from_ssz(err: ssz::DecodeError) -> WireError {
        match err {
            ssz::DecodeError::UnionSelectorInvalid(selector) => {
                WireError::UnknownSelector(selector)
            }
            other => WireError::Ssz(format!("{other:?}")),
        }
    }
}

pub type WireResult<T> = Result<T, WireError>;
