//! Wire-level types shared by every Portal sub-network: node identifiers and
//! XOR distance, ENR records, typed content keys, and the SSZ union codec for
//! the overlay message set.
//!
//! Everything here is plain data and pure functions. Transport, routing, and
//! storage live in the crates layered on top.

pub mod constants;
pub mod content_key;
pub mod enr;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use content_key::{BeaconContentKey, ContentId, HistoryContentKey, RawContentKey};
pub use enr::Enr;
pub use error::WireError;
pub use identity::NodeKeypair;
pub use messages::{Accept, Content, FindContent, FindNodes, Message, Nodes, Offer, Ping, Pong};
pub use types::{Distance, NodeId};

/// Sub-protocol identifiers registered with the discv5 TALKREQ dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    State,
    History,
    Beacon,
    Rendezvous,
    Utp,
}

impl ProtocolId {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            ProtocolId::State => vec![0x50, 0x0A],
            ProtocolId::History => vec![0x50, 0x0B],
            ProtocolId::Beacon => vec![0x50, 0x1A],
            ProtocolId::Rendezvous => vec![0x01, 0x01],
            ProtocolId::Utp => vec![0x75, 0x74, 0x70],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0x50, 0x0A] => Some(ProtocolId::State),
            [0x50, 0x0B] => Some(ProtocolId::History),
            [0x50, 0x1A] => Some(ProtocolId::Beacon),
            [0x01, 0x01] => Some(ProtocolId::Rendezvous),
            [0x75, 0x74, 0x70] => Some(ProtocolId::Utp),
            _ => None,
        }
    }
}
