//! Side-band multiplexer: the sending half of [`super::demux`]. Packet lines, packfile bytes,
//! progress text and fatal error text are merged into a single pkt-line stream, with band data cut
//! to the frame size allowed by the negotiated [`ProtocolMode`].

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::pkt_line::{encode, encode_band_into, flush};
use super::types::{GOODBYE_SENTINEL, ProtocolError, ProtocolMode, ProtocolStream, SideBand};
use crate::config::TransportConfig;

/// Packet lines to send unmarked. `None` is sent as a flush-pkt.
pub type PacketLineSource = Pin<Box<dyn Stream<Item = Option<Bytes>> + Send>>;
/// Raw bytes for one side-band channel.
pub type BandSource = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Counters for one multiplex run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MuxStats {
    pub frames: u64,
    pub packfile_bytes: u64,
    pub progress_bytes: u64,
    pub error_bytes: u64,
    pub sent_goodbye: bool,
}

/// Builder and driver for an outbound side-band stream.
///
/// A source that is never set counts as already ended.
pub struct SideBandMultiplexer {
    mode: ProtocolMode,
    capacity: usize,
    packetlines: Option<PacketLineSource>,
    packfile: Option<BandSource>,
    progress: Option<BandSource>,
    error: Option<BandSource>,
}

impl SideBandMultiplexer {
    pub fn new(mode: ProtocolMode) -> Self {
        Self::with_config(&TransportConfig {
            mode,
            ..Default::default()
        })
    }

    pub fn with_config(config: &TransportConfig) -> Self {
        Self {
            mode: config.mode,
            capacity: config.output_capacity(),
            packetlines: None,
            packfile: None,
            progress: None,
            error: None,
        }
    }

    pub fn packet_lines<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = Option<Bytes>> + Send + 'static,
    {
        self.packetlines = Some(Box::pin(source));
        self
    }

    pub fn packfile<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.packfile = Some(Box::pin(source));
        self
    }

    pub fn progress<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.progress = Some(Box::pin(source));
        self
    }

    /// Text sent on band 3. The receiving side treats it as a fatal abort.
    pub fn error<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.error = Some(Box::pin(source));
        self
    }

    /// Run on a new tokio task and return the framed output, one frame per item.
    ///
    /// The output channel is bounded, so sources are only polled as fast as the
    /// consumer drains frames. Dropping the stream stops the task.
    pub fn into_stream(self) -> ProtocolStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let report = tx.clone();
        tokio::spawn(async move {
            match self.pump(tx).await {
                Ok(stats) => tracing::debug!(
                    "side-band mux finished: {} frames, {} pack bytes",
                    stats.frames,
                    stats.packfile_bytes
                ),
                Err(ProtocolError::Closed(reason)) => {
                    tracing::debug!("side-band mux stopped: {}", reason)
                }
                Err(e) => {
                    tracing::warn!("side-band mux failed: {}", e);
                    let _ = report.send(Err(e)).await;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    /// Multiplex straight into `writer`, one `write_all` per frame, then flush it.
    pub async fn write_to<W>(self, writer: &mut W) -> Result<MuxStats, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<Result<Bytes, ProtocolError>>(self.capacity);
        let drain = async move {
            while let Some(frame) = rx.recv().await {
                writer.write_all(&frame?).await?;
            }
            writer.flush().await?;
            Ok::<(), ProtocolError>(())
        };
        let (pumped, drained) = tokio::join!(self.pump(tx), drain);
        drained?;
        pumped
    }

    async fn pump(
        self,
        tx: mpsc::Sender<Result<Bytes, ProtocolError>>,
    ) -> Result<MuxStats, ProtocolError> {
        let Self {
            mode,
            mut packetlines,
            mut packfile,
            mut progress,
            mut error,
            ..
        } = self;
        let max_data_len = mode.max_data_len();
        let mut stats = MuxStats::default();
        let mut packfile_was_empty = true;

        loop {
            let sources_open =
                packetlines.is_some() || packfile.is_some() || progress.is_some() || error.is_some();
            tokio::select! {
                // Fires on a dropped output even while every source is idle.
                _ = tx.closed(), if sources_open => {
                    return Err(ProtocolError::Closed("multiplexer output dropped".to_string()));
                }
                line = next_item(&mut packetlines), if packetlines.is_some() => match line {
                    Some(Some(line)) => emit(&tx, encode(&line)?, &mut stats).await?,
                    Some(None) => emit(&tx, flush(), &mut stats).await?,
                    None => packetlines = None,
                },
                chunk = next_item(&mut packfile), if packfile.is_some() => match chunk {
                    Some(chunk) => {
                        if !chunk.is_empty() {
                            packfile_was_empty = false;
                        }
                        stats.packfile_bytes += chunk.len() as u64;
                        emit_band(&tx, SideBand::PackfileData, &chunk, max_data_len, &mut stats)
                            .await?;
                    }
                    None => {
                        packfile = None;
                        if !packfile_was_empty {
                            emit_band(
                                &tx,
                                SideBand::ProgressInfo,
                                GOODBYE_SENTINEL,
                                max_data_len,
                                &mut stats,
                            )
                            .await?;
                            emit(&tx, flush(), &mut stats).await?;
                            stats.sent_goodbye = true;
                        }
                    }
                },
                chunk = next_item(&mut progress), if progress.is_some() => match chunk {
                    Some(chunk) => {
                        stats.progress_bytes += chunk.len() as u64;
                        emit_band(&tx, SideBand::ProgressInfo, &chunk, max_data_len, &mut stats)
                            .await?;
                    }
                    None => progress = None,
                },
                chunk = next_item(&mut error), if error.is_some() => match chunk {
                    Some(chunk) => {
                        stats.error_bytes += chunk.len() as u64;
                        emit_band(&tx, SideBand::Error, &chunk, max_data_len, &mut stats).await?;
                    }
                    None => error = None,
                },
                else => break,
            }
        }

        Ok(stats)
    }
}

async fn next_item<T>(source: &mut Option<Pin<Box<dyn Stream<Item = T> + Send>>>) -> Option<T> {
    match source {
        Some(source) => source.next().await,
        None => None,
    }
}

async fn emit(
    tx: &mpsc::Sender<Result<Bytes, ProtocolError>>,
    frame: Bytes,
    stats: &mut MuxStats,
) -> Result<(), ProtocolError> {
    tx.send(Ok(frame))
        .await
        .map_err(|_| ProtocolError::Closed("multiplexer output dropped".to_string()))?;
    stats.frames += 1;
    Ok(())
}

/// Frame `data` on `band`, split into pieces of at most `max_data_len` bytes.
async fn emit_band(
    tx: &mpsc::Sender<Result<Bytes, ProtocolError>>,
    band: SideBand,
    data: &[u8],
    max_data_len: usize,
    stats: &mut MuxStats,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    for piece in data.chunks(max_data_len) {
        encode_band_into(&mut buf, band.value(), piece)?;
        emit(tx, buf.split().freeze(), stats).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::protocol::pkt_line::{Packet, PktLineReader};

    async fn frames_of(stream: ProtocolStream) -> Vec<Bytes> {
        stream.map(|frame| frame.unwrap()).collect().await
    }

    #[tokio::test]
    async fn packet_lines_and_flush() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand64k)
            .packet_lines(stream::iter(vec![
                Some(Bytes::from_static(b"NAK\n")),
                None,
            ]))
            .into_stream();
        let frames = frames_of(out).await;
        assert_eq!(frames, vec![Bytes::from_static(b"0008NAK\n"), flush()]);
    }

    #[tokio::test]
    async fn packfile_gets_marker_and_goodbye() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand64k)
            .packfile(stream::iter(vec![Bytes::from_static(b"PACK")]))
            .into_stream();
        let frames = frames_of(out).await;
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"0009\x01PACK"),
                Bytes::from_static(b"0007\x02\x01\x0a"),
                Bytes::from_static(b"0000"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_packfile_sends_no_goodbye() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packfile(stream::iter(Vec::<Bytes>::new()))
            .progress(stream::iter(vec![Bytes::from_static(b"nothing to send\n")]))
            .into_stream();
        let wire: Vec<u8> = frames_of(out).await.concat();
        assert_eq!(wire, b"0015\x02nothing to send\n");
        assert!(
            !wire.windows(2).any(|w| w == GOODBYE_SENTINEL),
            "goodbye must be suppressed"
        );
    }

    #[tokio::test]
    async fn empty_chunks_do_not_count_as_pack_data() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packfile(stream::iter(vec![Bytes::new(), Bytes::new()]))
            .into_stream();
        assert!(frames_of(out).await.is_empty());
    }

    #[tokio::test]
    async fn side_band_frames_stay_under_1000_bytes() {
        let pack = Bytes::from(vec![7u8; 10_000]);
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packfile(stream::iter(vec![pack]))
            .into_stream();
        let frames = frames_of(out).await;
        assert!(frames.iter().all(|f| f.len() <= 1000));
        assert_eq!(frames[0].len(), 1000);
        assert_eq!(&frames[0][..5], b"03e8\x01");
        // 10 full frames, one of 50 bytes, goodbye and flush
        assert_eq!(frames.len(), 11 + 2);
    }

    #[tokio::test]
    async fn error_band_is_symmetric_with_progress() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand64k)
            .error(stream::iter(vec![Bytes::from_static(b"fatal: disk full")]))
            .into_stream();
        let frames = frames_of(out).await;
        assert_eq!(frames, vec![Bytes::from_static(b"0015\x03fatal: disk full")]);
    }

    #[tokio::test]
    async fn oversized_packet_line_fails_the_stream() {
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand64k)
            .packet_lines(stream::iter(vec![Some(Bytes::from(vec![b'a'; 70_000]))]))
            .into_stream();
        let items: Vec<_> = out.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ProtocolError::Framing(_))));
    }

    #[tokio::test]
    async fn write_to_produces_readable_frames() {
        let mut wire = Vec::new();
        let stats = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packet_lines(stream::iter(vec![Some(Bytes::from_static(b"ACK\n")), None]))
            .packfile(stream::iter(vec![Bytes::from_static(b"PACK")]))
            .write_to(&mut wire)
            .await
            .unwrap();
        assert!(stats.sent_goodbye);
        assert_eq!(stats.frames, 5);

        let mut reader = PktLineReader::from_reader(std::io::Cursor::new(wire), 16);
        let mut packets = Vec::new();
        loop {
            match reader.read_packet().await.unwrap() {
                Packet::End => break,
                packet => packets.push(packet),
            }
        }
        assert_eq!(packets.len(), 5);
        assert!(packets.contains(&Packet::Data(Bytes::from_static(b"ACK\n"))));
        assert!(packets.contains(&Packet::Data(Bytes::from_static(b"\x01PACK"))));
    }

    #[tokio::test]
    async fn dropping_output_releases_idle_sources() {
        let alive = Arc::new(());
        let held = alive.clone();
        let idle = stream::pending::<Bytes>().map(move |chunk| {
            let _held = &held;
            chunk
        });
        let out = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packfile(idle)
            .progress(stream::repeat(Bytes::from_static(b"progress\n")).take(3))
            .into_stream();
        let frames: Vec<_> = out.take(3).collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(Arc::strong_count(&alive), 2);

        // `take` dropped the output; the pump is still parked on the idle packfile.
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&alive) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("packfile source still held after the output was dropped");
    }

    #[tokio::test]
    async fn failed_writer_stops_the_pump() {
        let (server, client) = tokio::io::duplex(64);
        drop(client);
        let mut server = server;
        let outcome = SideBandMultiplexer::new(ProtocolMode::SideBand)
            .packet_lines(stream::iter(vec![Some(Bytes::from_static(b"NAK\n"))]))
            .packfile(stream::pending::<Bytes>())
            .write_to(&mut server);
        let outcome = tokio::time::timeout(Duration::from_secs(1), outcome)
            .await
            .expect("write_to hung on an idle packfile after the writer failed");
        assert!(matches!(outcome, Err(ProtocolError::Io(_))));
    }
}
