//! Ref advertisement framing.

use bytes::{BufMut, BytesMut};

use super::pkt_line::encode_into;
use super::types::{LF, NUL, PKT_LINE_END_MARKER, ProtocolError, SP, ZERO_ID};

/// Build a ref advertisement: one pkt-line per `(oid, name)` pair, capabilities after a NUL on
/// the first line, terminated by a flush-pkt.
///
/// An empty ref list still has to carry the capabilities, so git advertises the zero id under
/// the name `capabilities^{}`.
pub fn build_advertisement(
    refs: &[(String, String)],
    capabilities: &str,
) -> Result<BytesMut, ProtocolError> {
    let mut pkt_line_stream = BytesMut::new();
    let mut line = Vec::new();

    if refs.is_empty() {
        line.extend_from_slice(ZERO_ID.as_bytes());
        line.push(SP);
        line.extend_from_slice(b"capabilities^{}");
        line.push(NUL);
        line.extend_from_slice(capabilities.as_bytes());
        line.push(LF);
        encode_into(&mut pkt_line_stream, &line)?;
    }

    for (idx, (oid, name)) in refs.iter().enumerate() {
        line.clear();
        line.extend_from_slice(oid.as_bytes());
        line.push(SP);
        line.extend_from_slice(name.as_bytes());
        if idx == 0 {
            line.push(NUL);
            line.extend_from_slice(capabilities.as_bytes());
        }
        line.push(LF);
        encode_into(&mut pkt_line_stream, &line)?;
    }

    pkt_line_stream.put(&PKT_LINE_END_MARKER[..]);
    tracing::debug!("advertised {} refs in {} bytes", refs.len(), pkt_line_stream.len());
    Ok(pkt_line_stream)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::pkt_line::{Packet, decode_frame};

    fn packets(mut buf: BytesMut) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(packet) = decode_frame(&mut buf).unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn advertisement_puts_capabilities_on_first_line() {
        let refs = vec![
            ("a".repeat(40), "HEAD".to_string()),
            ("b".repeat(40), "refs/heads/main".to_string()),
        ];
        let buf = build_advertisement(&refs, "side-band-64k ofs-delta").unwrap();
        let packets = packets(buf);
        assert_eq!(packets.len(), 3);
        let first = format!("{} HEAD\0side-band-64k ofs-delta\n", "a".repeat(40));
        assert_eq!(packets[0], Packet::Data(Bytes::from(first)));
        let second = format!("{} refs/heads/main\n", "b".repeat(40));
        assert_eq!(packets[1], Packet::Data(Bytes::from(second)));
        assert_eq!(packets[2], Packet::Flush);
    }

    #[test]
    fn empty_repository_advertises_capabilities() {
        let packets = packets(build_advertisement(&[], "side-band").unwrap());
        let expected = format!("{ZERO_ID} capabilities^{{}}\0side-band\n");
        assert_eq!(packets, vec![Packet::Data(Bytes::from(expected)), Packet::Flush]);
    }
}
