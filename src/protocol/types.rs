use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Unparsable length header, truncated frame or oversized payload.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The remote sent a side-band channel 3 frame. Displays the remote text verbatim.
    #[error("{0}")]
    FatalTransport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal channel went away before the transfer finished.
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl ProtocolError {
    pub fn framing(msg: impl Into<String>) -> Self {
        ProtocolError::Framing(msg.into())
    }

    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, ProtocolError::FatalTransport(_))
    }
}

// One read failure is reported on every demultiplexer sink, so errors must be duplicable.
impl Clone for ProtocolError {
    fn clone(&self) -> Self {
        match self {
            ProtocolError::Framing(msg) => ProtocolError::Framing(msg.clone()),
            ProtocolError::FatalTransport(msg) => ProtocolError::FatalTransport(msg.clone()),
            ProtocolError::Io(e) => ProtocolError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ProtocolError::Closed(msg) => ProtocolError::Closed(msg.clone()),
        }
    }
}

/// Chunked byte stream used for transport input and multiplexer output.
pub type ProtocolStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProtocolError>> + Send>>;

/// Side-band channels multiplexed onto one pkt-line stream
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SideBand {
    /// Sideband 1 contains packfile data
    PackfileData,
    /// Sideband 2 contains progress information
    ProgressInfo,
    /// Sideband 3 contains fatal error text
    Error,
}

impl SideBand {
    pub fn value(&self) -> u8 {
        match self {
            Self::PackfileData => b'\x01',
            Self::ProgressInfo => b'\x02',
            Self::Error => b'\x03',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'\x01' => Some(Self::PackfileData),
            b'\x02' => Some(Self::ProgressInfo),
            b'\x03' => Some(Self::Error),
            _ => None,
        }
    }
}

/// Negotiated side-band flavour, which bounds the size of every emitted frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// `side-band`: frames of at most 1000 bytes.
    #[serde(rename = "side-band")]
    SideBand,
    /// `side-band-64k`: frames of at most 65520 bytes.
    #[default]
    #[serde(rename = "side-band-64k")]
    SideBand64k,
}

impl ProtocolMode {
    /// Largest frame on the wire, length header and channel marker included.
    pub fn max_frame_len(&self) -> usize {
        match self {
            ProtocolMode::SideBand => 1000,
            ProtocolMode::SideBand64k => LARGE_PACKET_MAX,
        }
    }

    /// Largest channel payload carried by one frame.
    pub fn max_data_len(&self) -> usize {
        self.max_frame_len() - PKT_HEADER_LEN - 1
    }

    /// Picks the mode from a negotiated capability list, preferring 64k.
    pub fn from_capabilities(capabilities: &[Capability]) -> Option<Self> {
        if capabilities.contains(&Capability::SideBand64k) {
            Some(ProtocolMode::SideBand64k)
        } else if capabilities.contains(&Capability::SideBand) {
            Some(ProtocolMode::SideBand)
        } else {
            None
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolMode::SideBand => write!(f, "side-band"),
            ProtocolMode::SideBand64k => write!(f, "side-band-64k"),
        }
    }
}

/// Capabilities that influence framing. Anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    SideBand,
    SideBand64k,
    NoProgress,
    OfsDelta,
    ThinPack,
    ObjectFormat(String),
    Agent(String),
    Unknown(String),
}

impl Capability {
    /// Parses a space separated capability list as found after the NUL of the first ref line.
    pub fn parse_list(caps: &str) -> Vec<Capability> {
        caps.split_whitespace()
            .filter_map(|cap| cap.parse().ok())
            .collect()
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("object-format=") {
            return Ok(Capability::ObjectFormat(rest.to_string()));
        }

        match s {
            "side-band" => Ok(Capability::SideBand),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "no-progress" => Ok(Capability::NoProgress),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "thin-pack" => Ok(Capability::ThinPack),
            _ => Ok(Capability::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::SideBand => write!(f, "side-band"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::NoProgress => write!(f, "no-progress"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::ObjectFormat(format) => write!(f, "object-format={}", format),
            Capability::Agent(agent) => write!(f, "agent={}", agent),
            Capability::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Zero object ID constant
pub const ZERO_ID: &str = "0000000000000000000000000000000000000000";

/// Protocol constants
pub const LF: u8 = b'\n';
pub const SP: u8 = b' ';
pub const NUL: u8 = b'\0';
pub const PKT_LINE_END_MARKER: &[u8; 4] = b"0000";
pub const PKT_LINE_DELIM_MARKER: &[u8; 4] = b"0001";
pub const PKT_HEADER_LEN: usize = 4;
/// Largest value the 4 hex digit length header can carry.
pub const MAX_PKT_LEN: usize = 0xffff;
/// Largest payload `encode` accepts.
pub const MAX_PKT_PAYLOAD_LEN: usize = MAX_PKT_LEN - PKT_HEADER_LEN;
pub const LARGE_PACKET_MAX: usize = 65520;
/// Channel data sent on the progress band once a non-empty pack has been sent.
pub const GOODBYE_SENTINEL: &[u8; 2] = b"\x01\x0a";
