//! Error types for the text formats handled by vault-transport.
//!
//! Wire-level failures (framing, remote aborts) live in
//! [`crate::protocol::ProtocolError`]; this module covers the on-disk formats
//! consulted by the transport, currently the packed-refs file.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Errors raised while reading git text formats.
pub enum GitError {
    /// A packed-refs line could not be interpreted.
    #[error("Invalid packed-refs line {line}: `{content}` ({reason})")]
    InvalidPackedRefs {
        /// 1-based line number in the input.
        line: usize,
        content: String,
        reason: String,
    },

    /// Text encoding or UTF-8 conversion error.
    #[error("UTF-8 conversion error: {0}")]
    ConversionError(String),
}

impl GitError {
    pub(crate) fn packed_refs(line: usize, content: &str, reason: &str) -> Self {
        GitError::InvalidPackedRefs {
            line,
            content: content.to_string(),
            reason: reason.to_string(),
        }
    }
}
