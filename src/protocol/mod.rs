/// Git smart transport framing
///
/// This module provides the byte-level layer of the git smart protocol used for vault sync:
/// pkt-line framing, side-band multiplexing in both directions, and ref advertisement helpers.
/// Capability negotiation and pack generation sit above it and only hand it opaque bytes.
pub mod demux;
pub mod mux;
pub mod pkt_line;
pub mod types;
pub mod utils;

// Re-export main interfaces
pub use demux::{Demultiplexed, DemuxHandle, DemuxStats, SideBandDemultiplexer};
pub use mux::{MuxStats, SideBandMultiplexer};
pub use pkt_line::{Packet, PktLineReader};
pub use types::*;
