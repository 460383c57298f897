use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid inclusion proof")]
    InvalidProof,
    #[error("Unknown content type {0:#04x}")]
    UnknownContentType(u8),
    #[error("Content failed reassembly checks: {0}")]
    ReassemblyFailed(&'static str),
    #[error("Header {0} is not stored; cannot validate dependent content")]
    MissingHeader(String),
    #[error("No accumulator root for epoch {0}")]
    UnknownEpoch(u64),
    #[error("No historical root for period {0}")]
    UnknownPeriod(u64),
    #[error("Beacon fork digest mismatch")]
    ForkDigestMismatch,
    #[error("Malformed content: {0}")]
    MalformedContent(&'static str),
    #[error("Wire error: {0}")]
    Wire(#[from] portal_wire::WireError),
    #[error("SSZ decode error: {0}")]
    Ssz(String),
    #[error("RLP error: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn from_ssz(err: ssz::DecodeError) -> StoreError {
        StoreError::Ssz(format!("{err:?}"))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
