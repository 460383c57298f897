use thiserror::Error;

/// Terminal failures an overlay operation reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("Content not found")]
    NotFound,
    #[error("Lookup deadline exceeded")]
    LookupTimeout,
}

pub type OverlayResult<T> = Result<T, OverlayError>;
