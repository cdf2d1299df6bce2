//! Lossy single-client forwarder for encoder output.
//!
//! A live view has no use for stale frames, so when the client socket is
//! already holding more than the configured number of unsent bytes the
//! current chunk is discarded instead of queued.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use super::OutputFormat;
use super::transport::{Outbound, OutboundSink, SinkClosed};

/// Errors raised while forwarding media.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MuxError {
    /// The client connection is gone; the owning session must tear down
    #[error("Client sink closed while forwarding media")]
    SinkClosed,

    /// The multiplexer already released its sink
    #[error("Multiplexer has been released")]
    Released,
}

impl From<SinkClosed> for MuxError {
    fn from(_: SinkClosed) -> Self {
        MuxError::SinkClosed
    }
}

/// Destination of forwarded media chunks.
pub trait MediaSink {
    /// Bytes accepted by the sink but not yet delivered.
    fn buffered_amount(&self) -> usize;

    /// Queues one binary chunk.
    ///
    /// # Errors
    ///
    /// - `SinkClosed` - The sink can no longer accept data
    fn send_media(&self, chunk: Bytes) -> Result<(), SinkClosed>;
}

impl MediaSink for OutboundSink {
    fn buffered_amount(&self) -> usize {
        OutboundSink::buffered_amount(self)
    }

    fn send_media(&self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.send(Outbound::Binary(chunk))
    }
}

/// What happened to a chunk handed to [`Multiplexer::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded,
    /// Discarded because the sink was over the backpressure threshold
    Dropped,
}

/// Forwarding counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub chunks_forwarded: u64,
    pub bytes_forwarded: u64,
    pub chunks_dropped: u64,
    pub bytes_dropped: u64,
}

/// Forwards one encoder's output to exactly one sink.
pub struct Multiplexer<S: MediaSink> {
    sink: Option<S>,
    threshold: usize,
    format: OutputFormat,
    /// Whether the current encoder's first chunk has reached the sink
    init_forwarded: bool,
    stats: MuxStats,
}

impl<S: MediaSink> Multiplexer<S> {
    /// Creates a multiplexer that drops chunks while `sink` holds more than `threshold` bytes.
    pub fn new(sink: S, threshold: usize, format: OutputFormat) -> Self {
        Self {
            sink: Some(sink),
            threshold,
            format,
            init_forwarded: false,
            stats: MuxStats::default(),
        }
    }

    /// Forwards `chunk` unless the sink is congested.
    ///
    /// The first chunk after [`begin_stream`](Self::begin_stream) carries the
    /// initialization segment and is never dropped.
    ///
    /// # Errors
    ///
    /// - `MuxError::SinkClosed` - Sending failed; the caller must tear the session down
    /// - `MuxError::Released` - The sink reference was already released
    pub fn forward(&mut self, chunk: Bytes) -> Result<ForwardOutcome, MuxError> {
        let sink = self.sink.as_ref().ok_or(MuxError::Released)?;
        let len = chunk.len() as u64;
        let outstanding = sink.buffered_amount();

        if self.init_forwarded && outstanding > self.threshold {
            self.stats.chunks_dropped += 1;
            self.stats.bytes_dropped += len;
            trace!(
                outstanding,
                threshold = self.threshold,
                dropped = len,
                "Sink congested, dropping chunk"
            );
            return Ok(ForwardOutcome::Dropped);
        }

        if !self.init_forwarded {
            debug!(
                bytes = len,
                looks_like_init = self.format.starts_init_segment(&chunk),
                "Forwarding first chunk of encoder output"
            );
        }

        sink.send_media(chunk)?;
        self.init_forwarded = true;
        self.stats.chunks_forwarded += 1;
        self.stats.bytes_forwarded += len;
        Ok(ForwardOutcome::Forwarded)
    }

    /// Prepares for a freshly started encoder whose output begins with a new
    /// initialization segment.
    pub fn begin_stream(&mut self, format: OutputFormat) {
        self.format = format;
        self.init_forwarded = false;
    }

    /// Drops the reference to the sink. Later forwards fail with `Released`.
    pub fn release(&mut self) {
        if self.sink.take().is_some() {
            debug!(?self.stats, "Multiplexer released its sink");
        }
    }

    pub fn is_released(&self) -> bool {
        self.sink.is_none()
    }

    pub fn stats(&self) -> MuxStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    /// Sink whose outstanding byte count is set by the test.
    #[derive(Default)]
    struct ScriptedSink {
        buffered: Cell<usize>,
        sent: RefCell<Vec<Bytes>>,
        closed: Cell<bool>,
    }

    impl MediaSink for &ScriptedSink {
        fn buffered_amount(&self) -> usize {
            self.buffered.get()
        }

        fn send_media(&self, chunk: Bytes) -> Result<(), SinkClosed> {
            if self.closed.get() {
                return Err(SinkClosed);
            }
            self.sent.borrow_mut().push(chunk);
            Ok(())
        }
    }

    fn chunk(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 16])
    }

    #[test]
    fn test_forwards_in_order_under_threshold() {
        let sink = ScriptedSink::default();
        let mut mux = Multiplexer::new(&sink, 1024, OutputFormat::Mp4);

        for byte in 0..5 {
            assert_eq!(mux.forward(chunk(byte)).unwrap(), ForwardOutcome::Forwarded);
        }

        let sent = sink.sent.borrow();
        let firsts: Vec<u8> = sent.iter().map(|c| c[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3, 4]);
        assert_eq!(mux.stats().chunks_forwarded, 5);
    }

    #[test]
    fn test_drops_while_congested_then_resumes() {
        let sink = ScriptedSink::default();
        let mut mux = Multiplexer::new(&sink, 1024, OutputFormat::Mp4);
        mux.forward(chunk(0)).unwrap();

        sink.buffered.set(2048);
        assert_eq!(mux.forward(chunk(1)).unwrap(), ForwardOutcome::Dropped);
        assert_eq!(mux.forward(chunk(2)).unwrap(), ForwardOutcome::Dropped);

        sink.buffered.set(512);
        assert_eq!(mux.forward(chunk(3)).unwrap(), ForwardOutcome::Forwarded);

        let stats = mux.stats();
        assert_eq!(stats.chunks_dropped, 2);
        assert_eq!(stats.bytes_dropped, 32);
        assert_eq!(sink.sent.borrow().len(), 2);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let sink = ScriptedSink::default();
        let mut mux = Multiplexer::new(&sink, 1024, OutputFormat::Mp4);
        mux.forward(chunk(0)).unwrap();

        sink.buffered.set(1024);
        assert_eq!(mux.forward(chunk(1)).unwrap(), ForwardOutcome::Forwarded);
    }

    #[test]
    fn test_first_chunk_of_new_stream_is_never_dropped() {
        let sink = ScriptedSink::default();
        let mut mux = Multiplexer::new(&sink, 10, OutputFormat::Mp4);
        sink.buffered.set(10_000);

        assert_eq!(mux.forward(chunk(0)).unwrap(), ForwardOutcome::Forwarded);
        assert_eq!(mux.forward(chunk(1)).unwrap(), ForwardOutcome::Dropped);

        mux.begin_stream(OutputFormat::Webm);
        assert_eq!(mux.forward(chunk(2)).unwrap(), ForwardOutcome::Forwarded);
    }

    #[test]
    fn test_send_failure_is_reported() {
        let sink = ScriptedSink::default();
        sink.closed.set(true);
        let mut mux = Multiplexer::new(&sink, 1024, OutputFormat::Mp4);

        assert_eq!(mux.forward(chunk(0)), Err(MuxError::SinkClosed));
    }

    #[test]
    fn test_release_drops_sink_reference() {
        let sink = ScriptedSink::default();
        let mut mux = Multiplexer::new(&sink, 1024, OutputFormat::Mp4);

        mux.release();
        mux.release();

        assert!(mux.is_released());
        assert_eq!(mux.forward(chunk(0)), Err(MuxError::Released));
    }
}
