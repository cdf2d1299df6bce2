//! Transport-agnostic socket frames and the outbound queue that tracks
//! how many bytes are still waiting to be written to the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::protocol::CloseCode;

/// Frames arriving from the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    /// Transport-level pong answering one of our pings
    Pong,
    /// The peer closed the connection or the transport failed
    Closed,
}

/// Frames queued for the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    /// Transport-level ping
    Ping,
    Close { code: CloseCode, reason: String },
}

impl Outbound {
    /// Bytes this frame contributes to the outstanding count.
    pub fn weight(&self) -> usize {
        match self {
            Outbound::Text(text) => text.len(),
            Outbound::Binary(data) => data.len(),
            Outbound::Ping | Outbound::Close { .. } => 0,
        }
    }
}

/// The connection writer has gone away.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("client connection is closed")]
pub struct SinkClosed;

/// Creates a linked outbound sink and receiver pair.
///
/// The session owns the sink; the connection writer drains the receiver and
/// calls [`OutboundReceiver::settle`] once a frame has actually been written.
pub fn outbound_channel() -> (OutboundSink, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));

    (
        OutboundSink {
            tx,
            buffered: Arc::clone(&buffered),
        },
        OutboundReceiver { rx, buffered },
    )
}

/// Sending half used by the session.
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
}

impl OutboundSink {
    /// Queues a frame for the writer.
    ///
    /// # Errors
    ///
    /// - `SinkClosed` - The writer has stopped draining the queue
    pub fn send(&self, frame: Outbound) -> Result<(), SinkClosed> {
        let weight = frame.weight();
        self.buffered.fetch_add(weight, Ordering::AcqRel);
        self.tx.send(frame).map_err(|_| {
            self.buffered.fetch_sub(weight, Ordering::AcqRel);
            SinkClosed
        })
    }

    /// Bytes queued or in flight that the writer has not settled yet.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Returns true once the writer has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half drained by the connection writer.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
    buffered: Arc<AtomicUsize>,
}

impl OutboundReceiver {
    /// Waits for the next queued frame. Returns `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Marks a frame returned by [`recv`](Self::recv) as written.
    pub fn settle(&self, frame: &Outbound) {
        let weight = frame.weight();
        // Saturating: a frame is settled at most once by the single writer.
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(weight))
            });
    }

    /// Bytes queued or in flight that have not been settled.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}
