//! The Portal node: wires the overlay networks, the shared uTP multiplexer,
//! and the content store to an authenticated datagram transport, and drives
//! them from `handle_*` entry points plus a `poll()` timer.

pub mod error;
pub mod identity;
pub mod node;
pub mod transport;

pub use error::NodeError;
pub use identity::PersistedIdentity;
pub use node::{NodeConfig, PortalEvent, PortalNode};
pub use transport::{TalkTransport, TransportError};
