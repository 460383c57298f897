use thiserror::Error;

/// Errors surfaced by the uTP transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UtpError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("Packet arrived in state that cannot accept it")]
    UnexpectedState,
    #[error("Socket timed out after retries were exhausted")]
    SocketTimeout,
    #[error("Connection reset by peer")]
    ConnectionReset,
    #[error("Out-of-order buffer overflow")]
    BufferOverflow,
    #[error("Transfer watchdog expired")]
    WatchdogExpired,
    #[error("Connection id already in use")]
    ConnectionIdCollision,
}

pub type UtpResult<T> = Result<T, UtpError>;
