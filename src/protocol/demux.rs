//! Side-band demultiplexer: splits one inbound pkt-line stream into packet lines, packfile bytes
//! and progress text. Each output is a bounded channel, so a slow consumer suspends the read loop
//! instead of letting frames pile up in memory.

use bytes::Bytes;
use futures::stream::Stream;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::pkt_line::{Packet, PktLineReader};
use super::types::{ProtocolError, ProtocolStream, SideBand};
use crate::config::TransportConfig;

/// Items delivered on every demultiplexer output. An `Err` is always the last item.
pub type DemuxItem = Result<Bytes, ProtocolError>;

/// Sending halves of the three outputs.
pub struct DemuxSinks {
    pub packetlines: mpsc::Sender<DemuxItem>,
    pub packfile: mpsc::Sender<DemuxItem>,
    pub progress: mpsc::Sender<DemuxItem>,
}

/// Receiving halves of the three outputs.
pub struct DemuxOutputs {
    /// Frames without a side-band marker, e.g. the ref advertisement.
    pub packetlines: ReceiverStream<DemuxItem>,
    /// Channel 1 data. Ends with `Err(FatalTransport)` if the remote aborts.
    pub packfile: ReceiverStream<DemuxItem>,
    /// Channel 2 text, plus the channel 3 message on abort.
    pub progress: ReceiverStream<DemuxItem>,
}

/// Create the bounded output channels.
pub fn channels(capacity: usize) -> (DemuxSinks, DemuxOutputs) {
    let capacity = capacity.max(1);
    let (packetlines_tx, packetlines_rx) = mpsc::channel(capacity);
    let (packfile_tx, packfile_rx) = mpsc::channel(capacity);
    let (progress_tx, progress_rx) = mpsc::channel(capacity);
    (
        DemuxSinks {
            packetlines: packetlines_tx,
            packfile: packfile_tx,
            progress: progress_tx,
        },
        DemuxOutputs {
            packetlines: ReceiverStream::new(packetlines_rx),
            packfile: ReceiverStream::new(packfile_rx),
            progress: ReceiverStream::new(progress_rx),
        },
    )
}

/// Counters for one demultiplex run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemuxStats {
    pub frames: u64,
    pub flushes: u64,
    pub packetline_frames: u64,
    pub packfile_bytes: u64,
    pub progress_bytes: u64,
}

/// A demultiplexer running on its own task.
pub struct Demultiplexed {
    pub packetlines: ReceiverStream<DemuxItem>,
    pub packfile: ReceiverStream<DemuxItem>,
    pub progress: ReceiverStream<DemuxItem>,
    pub task: DemuxHandle,
}

/// Handle on a spawned read loop.
pub struct DemuxHandle(JoinHandle<Result<DemuxStats, ProtocolError>>);

impl DemuxHandle {
    /// Wait for the read loop to finish and return its outcome.
    pub async fn join(self) -> Result<DemuxStats, ProtocolError> {
        self.0
            .await
            .map_err(|e| ProtocolError::Closed(format!("demultiplexer task failed: {e}")))?
    }

    /// Stop reading immediately. Outputs close without an error item and the source is dropped.
    pub fn abort(&self) {
        self.0.abort();
    }
}

/// One output as seen by the read loop. A sink whose receiver is gone is detached and skipped.
struct Sink {
    name: &'static str,
    tx: Option<mpsc::Sender<DemuxItem>>,
}

impl Sink {
    fn new(name: &'static str, tx: mpsc::Sender<DemuxItem>) -> Self {
        Self { name, tx: Some(tx) }
    }

    async fn send(&mut self, item: DemuxItem) {
        if let Some(tx) = &self.tx {
            if tx.send(item).await.is_err() {
                tracing::debug!("{} consumer went away, detaching", self.name);
                self.tx = None;
            }
        }
    }

    /// Resolves once the consumer is gone.
    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }
}

async fn all_closed(packetlines: &Sink, packfile: &Sink, progress: &Sink) {
    tokio::join!(packetlines.closed(), packfile.closed(), progress.closed());
}

/// Reads a side-band multiplexed stream and routes each frame by its channel marker.
pub struct SideBandDemultiplexer<S> {
    reader: PktLineReader<S>,
    capacity: usize,
}

impl SideBandDemultiplexer<ProtocolStream> {
    /// Demultiplex bytes read from `reader`, typically a socket.
    pub fn from_reader<R>(reader: R, config: &TransportConfig) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::new(
            PktLineReader::from_reader(reader, config.read_chunk_size()),
            config,
        )
    }
}

impl<S> SideBandDemultiplexer<S>
where
    S: Stream<Item = Result<Bytes, ProtocolError>> + Unpin + Send + 'static,
{
    pub fn new(reader: PktLineReader<S>, config: &TransportConfig) -> Self {
        Self {
            reader,
            capacity: config.sink_capacity(),
        }
    }

    /// Run the read loop on a new tokio task.
    pub fn spawn(self) -> Demultiplexed {
        let (sinks, outputs) = channels(self.capacity);
        let task = tokio::spawn(self.run(sinks));
        Demultiplexed {
            packetlines: outputs.packetlines,
            packfile: outputs.packfile,
            progress: outputs.progress,
            task: DemuxHandle(task),
        }
    }

    /// Drive the read loop in the current task until end of stream, a fatal frame or an error.
    ///
    /// All sinks are closed when this returns. A remote abort is returned as
    /// `ProtocolError::FatalTransport` after being delivered to the sinks.
    pub async fn run(mut self, sinks: DemuxSinks) -> Result<DemuxStats, ProtocolError> {
        let mut packetlines = Sink::new("packetlines", sinks.packetlines);
        let mut packfile = Sink::new("packfile", sinks.packfile);
        let mut progress = Sink::new("progress", sinks.progress);
        let mut stats = DemuxStats::default();

        loop {
            // Consumer drops are noticed even while the read waits on the transport.
            let read = tokio::select! {
                biased;
                _ = all_closed(&packetlines, &packfile, &progress) => {
                    tracing::debug!("all demultiplexer outputs dropped, releasing source");
                    return Ok(stats);
                }
                read = self.reader.read_packet() => read,
            };

            let packet = match read {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("side-band stream failed after {} frames: {}", stats.frames, e);
                    tokio::join!(
                        packetlines.send(Err(e.clone())),
                        packfile.send(Err(e.clone())),
                        progress.send(Err(e.clone())),
                    );
                    return Err(e);
                }
            };

            let payload = match packet {
                Packet::Flush | Packet::Delim => {
                    stats.flushes += 1;
                    continue;
                }
                Packet::End => {
                    tracing::debug!(
                        "side-band stream ended: {} frames, {} pack bytes, {} bytes read",
                        stats.frames,
                        stats.packfile_bytes,
                        self.reader.bytes_read()
                    );
                    return Ok(stats);
                }
                Packet::Data(payload) => payload,
            };
            stats.frames += 1;

            match payload.first().copied().and_then(SideBand::from_byte) {
                Some(SideBand::PackfileData) => {
                    tracing::trace!("band 1: {} bytes", payload.len() - 1);
                    stats.packfile_bytes += (payload.len() - 1) as u64;
                    packfile.send(Ok(payload.slice(1..))).await;
                }
                Some(SideBand::ProgressInfo) => {
                    stats.progress_bytes += (payload.len() - 1) as u64;
                    progress.send(Ok(payload.slice(1..))).await;
                }
                Some(SideBand::Error) => {
                    let message = String::from_utf8_lossy(&payload[1..]).into_owned();
                    tracing::warn!("remote aborted transfer: {}", message.trim_end());
                    stats.progress_bytes += (payload.len() - 1) as u64;
                    tokio::join!(
                        progress.send(Ok(payload.slice(1..))),
                        packfile.send(Err(ProtocolError::FatalTransport(message.clone()))),
                    );
                    return Err(ProtocolError::FatalTransport(message));
                }
                None => {
                    stats.packetline_frames += 1;
                    packetlines.send(Ok(payload)).await;
                }
            }
        }
    }
}
