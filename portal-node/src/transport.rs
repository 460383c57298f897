//! The authenticated datagram service consumed by the node: discv5
//! TALKREQ/TALKRESP with session management handled below this interface.

use portal_wire::ProtocolId;
use portal_wire::types::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Peer unreachable")]
    PeerUnreachable,
    #[error("Session lost")]
    SessionLost,
}

/// Fire-and-forget sends over established discv5 sessions. Responses and
/// inbound requests re-enter through the node's `handle_talkresp` /
/// `handle_talkreq`.
pub trait TalkTransport: Send {
    /// Sends a TALKREQ; `request_id` correlates the eventual TALKRESP.
    fn send_talkreq(
        &self,
        dest: NodeId,
        protocol: ProtocolId,
        request_id: u64,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Answers a TALKREQ previously delivered to us.
    fn send_talkresp(
        &self,
        dest: NodeId,
        request_id: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}
