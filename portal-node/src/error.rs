use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("Wire error: {0}")]
    Wire(#[from] portal_wire::WireError),
    #[error("Store error: {0}")]
    Store(#[from] portal_store::StoreError),
    #[error("Unknown protocol id")]
    UnknownProtocol,
    #[error("Identity record is corrupt: {0}")]
    CorruptIdentity(String),
}

pub type NodeResult<T> = Result<T, NodeError>;
