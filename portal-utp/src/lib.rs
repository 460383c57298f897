//! # Portal uTP
//!
//! The micro-transport protocol carried inside discv5 TALKREQ payloads.
//!
//! This crate is sans-io: sockets and the multiplexer are plain state
//! machines that consume decoded packets plus an explicit `now`, and emit
//! packets to send and events to observe. The embedding layer owns the
//! datagram service and the clock.
//!
//! - **Framing**: fixed 20-byte big-endian header with a selective-ACK
//!   extension chain, byte-compatible with libutp.
//! - **Reliability**: cumulative ACK plus a 32-slot selective-ACK window.
//! - **Congestion control**: LEDBAT delay-based window with RFC 6298
//!   retransmission timeouts.

pub mod congestion;
pub mod error;
pub mod framing;
pub mod mux;
pub mod packet;
pub mod rtt;
pub mod socket;
pub mod time;

pub use congestion::Ledbat;
pub use error::UtpError;
pub use mux::{ContentRequest, RequestDirection, UtpMultiplexer, UtpMuxEvent};
pub use packet::{Packet, PacketType, SelectiveAck};
pub use socket::{ResetReason, SocketEvent, SocketRole, SocketState, UtpSocket};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

/// Fixed uTP payload size; larger content is split across DATA packets.
pub const PAYLOAD_SIZE: usize = 512;
