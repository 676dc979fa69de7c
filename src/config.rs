use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::types::ProtocolMode;

/// Tuning knobs for the side-band transport.
///
/// The channel capacities bound how many frames may sit between the read
/// loop and a slow consumer before the loop suspends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Depth of each demultiplexer output channel.
    #[serde(deserialize_with = "string_or_usize")]
    pub sink_capacity: usize,
    /// Depth of the multiplexer output channel.
    #[serde(deserialize_with = "string_or_usize")]
    pub output_capacity: usize,
    /// Bytes requested per read when wrapping an `AsyncRead` source.
    #[serde(deserialize_with = "string_or_usize")]
    pub read_chunk_size: usize,
    pub mode: ProtocolMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sink_capacity: 16,
            output_capacity: 16,
            read_chunk_size: 64 * 1024,
            mode: ProtocolMode::SideBand64k,
        }
    }
}

impl TransportConfig {
    /// Channels of capacity zero would panic in tokio; clamp to one.
    pub(crate) fn sink_capacity(&self) -> usize {
        self.sink_capacity.max(1)
    }

    pub(crate) fn output_capacity(&self) -> usize {
        self.output_capacity.max(1)
    }

    pub(crate) fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }
}

fn string_or_usize<'deserialize, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrUSize {
        String(String),
        USize(usize),
    }

    match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::String(v) => v.trim().parse().map_err(serde::de::Error::custom),
        StringOrUSize::USize(v) => Ok(v),
    }
}
