//! Playback sink abstraction the ingest buffer feeds.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Failure reported by a playback sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppendError {
    /// An earlier operation has not finished yet
    #[error("Playback sink is still processing the previous operation")]
    Busy,

    /// The sink is in a state that cannot take this data
    #[error("Playback sink rejected the data: {0}")]
    Rejected(String),
}

/// How an accepted sink operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done before the call returned
    Immediate,
    /// Finishes later; the owner reports readiness through the ingest buffer
    Pending,
}

/// An append-only media buffer that may be transiently busy.
pub trait PlaybackSink {
    /// Starts appending one fragment.
    ///
    /// # Errors
    ///
    /// - `AppendError::Busy` - The previous operation is still running
    /// - `AppendError::Rejected` - The data cannot be appended in the current state
    fn append(&mut self, fragment: &Bytes) -> Result<Completion, AppendError>;

    /// Whether an operation is still running.
    fn is_updating(&self) -> bool;

    /// Start and end of buffered media, if any.
    fn buffered_range(&self) -> Option<(Duration, Duration)>;

    /// Playback position.
    fn current_time(&self) -> Duration;

    /// Starts removing buffered media in `[start, end)`.
    ///
    /// # Errors
    ///
    /// - `AppendError::Busy` - The previous operation is still running
    /// - `AppendError::Rejected` - The range cannot be removed
    fn remove(&mut self, start: Duration, end: Duration) -> Result<Completion, AppendError>;
}
