//! The Portal overlay protocol engine: the XOR-bucketed routing table, the
//! PING/FINDNODES/FINDCONTENT/OFFER handler set, recursive content lookup,
//! and neighborhood gossip selection.
//!
//! Like the transport underneath it, everything here is a plain state
//! machine: handlers take decoded messages plus `now` and return the
//! response, datagrams to emit, and events for the embedding node.

pub mod error;
pub mod lookup;
pub mod network;
pub mod table;

pub use error::OverlayError;
pub use lookup::{ContentLookup, LookupOutcome, LookupStatus};
pub use network::{ContentBackend, HandleOutcome, OverlayEvent, OverlayNetwork};
pub use table::{AddOutcome, RoutingTable};
