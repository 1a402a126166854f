//! Market data feed client library.
//!
//! This crate provides the core types and logic used by the `market_feed`
//! client binary and the `replay` tool:
//!
//! - `frame`: cuts the TCP byte stream into fixed 17-byte frames
//! - `packet`: decodes and validates frames into [`Packet`]s
//! - `store`: sequence-indexed, deduplicating packet store with gap detection
//! - `session`: the request / stream / resend state machine
//! - `integrity` and `sink`: final completeness check and JSON export
//! - `record`: optional CRC-framed capture of every raw frame received
//! - `replay`: runs a capture back through the store offline
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/replay.rs`)
//! wire these modules to a real TCP endpoint and to capture files.
pub mod error;
pub mod frame;
pub mod integrity;
pub mod packet;
pub mod protocol;
pub mod record;
pub mod replay;
pub mod session;
pub mod sink;
pub mod store;
pub mod transport;

pub use error::{IntegrityViolation, MalformedPacket, SessionError, TransportError};
pub use packet::{Packet, Side, Symbol, PACKET_SIZE};
pub use session::{Session, SessionConfig, SessionReport, SessionState};
pub use sink::{JsonFileSink, PacketSink};
pub use store::PacketStore;
pub use transport::{Connector, TcpConnector};
