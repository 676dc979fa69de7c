//! pkt-line framing: a 4 hex digit length (counting itself) followed by the payload, plus the
//! `0000` flush-pkt and `0001` delim-pkt markers. Decoding is incremental so that frames split
//! across arbitrary network reads are reassembled without ever surfacing a partial frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use super::types::{
    MAX_PKT_PAYLOAD_LEN, PKT_HEADER_LEN, PKT_LINE_DELIM_MARKER, PKT_LINE_END_MARKER,
    ProtocolError, ProtocolStream,
};

/// One decoded unit of a pkt-line stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A data frame, length header stripped.
    Data(Bytes),
    /// `0000`
    Flush,
    /// `0001`
    Delim,
    /// The underlying source is exhausted on a frame boundary.
    End,
}

/// Frame a payload as a single pkt-line.
pub fn encode(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::with_capacity(PKT_HEADER_LEN + payload.len());
    encode_into(&mut out, payload)?;
    Ok(out.freeze())
}

/// Append a framed payload to `out`.
pub fn encode_into(out: &mut BytesMut, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PKT_PAYLOAD_LEN {
        return Err(ProtocolError::framing(format!(
            "payload of {} bytes does not fit a pkt-line (max {MAX_PKT_PAYLOAD_LEN})",
            payload.len()
        )));
    }
    let pkt_length = payload.len() + PKT_HEADER_LEN;
    out.reserve(pkt_length);
    out.put(format!("{pkt_length:04x}").as_bytes());
    out.put(payload);
    Ok(())
}

/// Frame a side-band payload: the channel marker is counted in the length header.
pub(crate) fn encode_band_into(
    out: &mut BytesMut,
    band: u8,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if data.len() + 1 > MAX_PKT_PAYLOAD_LEN {
        return Err(ProtocolError::framing(format!(
            "side-band payload of {} bytes does not fit a pkt-line",
            data.len()
        )));
    }
    let pkt_length = data.len() + 1 + PKT_HEADER_LEN;
    out.reserve(pkt_length);
    out.put(format!("{pkt_length:04x}").as_bytes());
    out.put_u8(band);
    out.put(data);
    Ok(())
}

pub fn flush() -> Bytes {
    Bytes::from_static(PKT_LINE_END_MARKER)
}

pub fn delim() -> Bytes {
    Bytes::from_static(PKT_LINE_DELIM_MARKER)
}

fn parse_length(header: &[u8]) -> Result<usize, ProtocolError> {
    header.iter().try_fold(0usize, |acc, byte| {
        let digit = (*byte as char).to_digit(16).ok_or_else(|| {
            tracing::warn!("Invalid hex packet length: {:?}", header);
            ProtocolError::framing(format!(
                "invalid pkt-line length header {:?}",
                String::from_utf8_lossy(header)
            ))
        })?;
        Ok(acc * 16 + digit as usize)
    })
}

/// Take one frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the next frame is still incomplete.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < PKT_HEADER_LEN {
        return Ok(None);
    }

    let pkt_length = parse_length(&buf[..PKT_HEADER_LEN])?;
    match pkt_length {
        0 => {
            buf.advance(PKT_HEADER_LEN);
            Ok(Some(Packet::Flush))
        }
        1 => {
            buf.advance(PKT_HEADER_LEN);
            Ok(Some(Packet::Delim))
        }
        2 | 3 => {
            tracing::warn!("Invalid packet length: {} (must be >= 4)", pkt_length);
            Err(ProtocolError::framing(format!(
                "pkt-line length {pkt_length:04x} is reserved or too short"
            )))
        }
        _ => {
            if buf.len() < pkt_length {
                return Ok(None);
            }
            buf.advance(PKT_HEADER_LEN);
            let payload = buf.split_to(pkt_length - PKT_HEADER_LEN).freeze();
            Ok(Some(Packet::Data(payload)))
        }
    }
}

/// Pull-based pkt-line reader over a chunked byte source.
///
/// Each call to [`PktLineReader::read_packet`] suspends until a whole frame is buffered.
pub struct PktLineReader<S> {
    source: S,
    buf: BytesMut,
    bytes_read: u64,
    finished: bool,
}

impl<S> PktLineReader<S>
where
    S: Stream<Item = Result<Bytes, ProtocolError>> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            bytes_read: 0,
            finished: false,
        }
    }

    /// Total bytes of complete frames handed out so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next frame, flush, delim or end marker.
    ///
    /// Once `End` or an error has been returned, every later call yields `End`.
    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        if self.finished {
            return Ok(Packet::End);
        }

        loop {
            let before = self.buf.len();
            match decode_frame(&mut self.buf) {
                Ok(Some(packet)) => {
                    self.bytes_read += (before - self.buf.len()) as u64;
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            }

            match self.source.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                None => {
                    self.finished = true;
                    if self.buf.is_empty() {
                        return Ok(Packet::End);
                    }
                    return Err(ProtocolError::framing(format!(
                        "stream ended inside a pkt-line ({} bytes buffered)",
                        self.buf.len()
                    )));
                }
            }
        }
    }
}

impl PktLineReader<ProtocolStream> {
    /// Wrap an async reader such as a socket, reading up to `chunk_size` bytes at a time.
    pub fn from_reader<R>(reader: R, chunk_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let stream = ReaderStream::with_capacity(reader, chunk_size.max(1))
            .map(|chunk| chunk.map_err(ProtocolError::from));
        Self::new(Box::pin(stream))
    }
}
