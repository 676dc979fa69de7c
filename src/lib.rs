//! Vault-Transport: the git smart transport framing used to sync vaults between peers.
//!
//! Goals
//! - Byte-exact pkt-line and side-band framing, so unmodified git clients and servers interoperate.
//! - Correct handling of partial reads: frames split across network reads are reassembled.
//! - Bounded memory: every output is a bounded channel, so slow consumers apply backpressure.
//! - Clean aborts: a remote fatal-error frame stops reading without corrupting delivered data.
//!
//! Core Capabilities
//! - `protocol::pkt_line`: encode, flush/delim markers, incremental decode, `PktLineReader`.
//! - `protocol::demux`: split a multiplexed stream into packet lines, packfile and progress.
//! - `protocol::mux`: merge packet lines, packfile, progress and error text into one stream.
//! - `internal::packed_refs`: parse and write the packed-refs file used for ref advertisement.
//!
//! Modules
//! - `protocol`: wire framing, side-band types, errors and advertisement helpers.
//! - `internal`: on-disk formats.
//! - `config`: transport tuning knobs.
//! - `errors`: text format errors.
//!
//! Typical Usage
//! - Fetch: `SideBandDemultiplexer::from_reader(socket, &config).spawn()` and drain the outputs.
//! - Serve: `SideBandMultiplexer::with_config(&config).packfile(pack).into_stream()`.

pub mod config;
pub mod errors;
pub mod internal;
pub mod protocol;

pub use config::TransportConfig;
pub use errors::GitError;
pub use internal::packed_refs::{PackedRefs, PackedRefsEntry};
pub use protocol::{
    Packet, PktLineReader, ProtocolError, ProtocolMode, SideBand, SideBandDemultiplexer,
    SideBandMultiplexer,
};
