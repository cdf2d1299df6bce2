//! Client ingest buffer.
//!
//! Fragments arrive in transport order and are committed to a
//! [`PlaybackSink`] one at a time. The buffer owns the only busy flag, so
//! a second append can never start while the sink is still working on the
//! first. All methods are synchronous; timers live in the actor that drives
//! the buffer (see [`spawn_ingest`](super::spawn_ingest)).

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::sink::{AppendError, Completion, PlaybackSink};
use crate::config::IngestConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("Ingest actor has shut down")]
    ActorShutdown,

    #[error(transparent)]
    Sink(#[from] AppendError),
}

/// Where the commit loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Queue is empty
    Idle,
    /// An operation is in flight; waiting for the sink's ready signal
    AwaitingSink,
    /// Append failed; call [`IngestBuffer::on_retry_timer`] after the delay
    RetryScheduled(Duration),
    /// A retry timer is already armed
    RetryPending,
    /// Error budget exhausted; the queue was discarded
    Flushed { dropped: usize },
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// Sink busy or recovering from errors
    Skipped,
    /// Buffered media is within the retention window
    NothingToTrim,
    Trimmed { start: Duration, end: Duration },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub appended: u64,
    pub bytes_appended: u64,
    /// Discarded by the queue bound
    pub dropped_overflow: u64,
    /// Discarded when the error budget ran out
    pub dropped_flush: u64,
    pub append_errors: u64,
    pub flushes: u64,
    pub trims: u64,
}

pub struct IngestBuffer<S: PlaybackSink> {
    sink: S,
    config: IngestConfig,
    queue: VecDeque<Bytes>,
    sink_busy: bool,
    retry_pending: bool,
    consecutive_errors: u32,
    last_append_at: Option<Instant>,
    init_seen: bool,
    stats: IngestStats,
}

impl<S: PlaybackSink> IngestBuffer<S> {
    pub fn new(sink: S, config: IngestConfig) -> Self {
        Self {
            sink,
            config,
            queue: VecDeque::new(),
            sink_busy: false,
            retry_pending: false,
            consecutive_errors: 0,
            last_append_at: None,
            init_seen: false,
            stats: IngestStats::default(),
        }
    }

    /// Enqueues a fragment, enforces the queue bound and tries to commit.
    ///
    /// When the queue grows past the bound the oldest entries are dropped,
    /// at least half of the queue, so the newest data survives.
    pub fn on_fragment_arrived(&mut self, fragment: Bytes) -> CommitOutcome {
        self.stats.received += 1;
        self.queue.push_back(fragment);

        let len = self.queue.len();
        let limit = self.config.max_queue_len;
        if len > limit {
            let excess = (len / 2).max(len - limit);
            self.queue.drain(..excess);
            self.stats.dropped_overflow += excess as u64;
            debug!(dropped = excess, kept = self.queue.len(), "Ingest queue over limit");
        }

        self.commit()
    }

    /// Commits queued fragments while the sink is idle.
    ///
    /// Safe to call at any time; it does nothing while an operation is in
    /// flight or a retry is pending.
    pub fn commit(&mut self) -> CommitOutcome {
        loop {
            if self.sink_busy || self.sink.is_updating() {
                return CommitOutcome::AwaitingSink;
            }
            if self.retry_pending {
                return CommitOutcome::RetryPending;
            }
            let Some(fragment) = self.queue.front() else {
                return CommitOutcome::Idle;
            };

            match self.sink.append(fragment) {
                Ok(completion) => {
                    if let Some(fragment) = self.queue.pop_front() {
                        self.record_append(fragment.len());
                    }
                    if completion == Completion::Pending {
                        self.sink_busy = true;
                        return CommitOutcome::AwaitingSink;
                    }
                }
                Err(e) => return self.record_failure(e),
            }
        }
    }

    /// The sink finished its previous operation.
    pub fn on_sink_ready(&mut self) -> CommitOutcome {
        self.sink_busy = false;
        self.commit()
    }

    /// The retry delay after a failed append elapsed.
    pub fn on_retry_timer(&mut self) -> CommitOutcome {
        self.retry_pending = false;
        self.commit()
    }

    /// Trims media behind the playhead once more than the retention window
    /// is buffered, keeping the configured trim target.
    pub fn on_maintenance_tick(&mut self) -> MaintenanceOutcome {
        if self.sink_busy
            || self.sink.is_updating()
            || self.retry_pending
            || self.consecutive_errors > 0
        {
            return MaintenanceOutcome::Skipped;
        }

        let Some((start, _end)) = self.sink.buffered_range() else {
            return MaintenanceOutcome::NothingToTrim;
        };
        let current = self.sink.current_time();
        if current.saturating_sub(start) <= self.config.retention {
            return MaintenanceOutcome::NothingToTrim;
        }

        let trim_end = current.saturating_sub(self.config.trim_to);
        match self.sink.remove(start, trim_end) {
            Ok(completion) => {
                if completion == Completion::Pending {
                    self.sink_busy = true;
                }
                self.stats.trims += 1;
                debug!(?start, ?trim_end, "Trimmed played-back media");
                MaintenanceOutcome::Trimmed {
                    start,
                    end: trim_end,
                }
            }
            Err(e) => {
                debug!("Skipping trim: {}", e);
                MaintenanceOutcome::Skipped
            }
        }
    }

    fn record_append(&mut self, len: usize) {
        if !self.init_seen {
            self.init_seen = true;
            debug!(bytes = len, "First fragment committed");
        }
        self.consecutive_errors = 0;
        self.last_append_at = Some(Instant::now());
        self.stats.appended += 1;
        self.stats.bytes_appended += len as u64;
        trace!(bytes = len, queued = self.queue.len(), "Fragment committed");
    }

    fn record_failure(&mut self, error: AppendError) -> CommitOutcome {
        self.consecutive_errors += 1;
        self.stats.append_errors += 1;

        if self.consecutive_errors >= self.config.max_chunk_errors {
            let dropped = self.queue.len();
            self.queue.clear();
            self.consecutive_errors = 0;
            self.stats.flushes += 1;
            self.stats.dropped_flush += dropped as u64;
            warn!(
                dropped,
                "Too many consecutive append errors, discarding queued fragments"
            );
            return CommitOutcome::Flushed { dropped };
        }

        trace!(errors = self.consecutive_errors, "Append failed: {}", error);
        self.retry_pending = true;
        CommitOutcome::RetryScheduled(self.config.retry_delay)
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_sink_busy(&self) -> bool {
        self.sink_busy
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Whether any fragment, and so the initialization segment, reached the sink.
    pub fn init_seen(&self) -> bool {
        self.init_seen
    }

    pub fn last_append_at(&self) -> Option<Instant> {
        self.last_append_at
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records appends and fails or defers on request.
    #[derive(Default)]
    struct MockSink {
        appended: Vec<u8>,
        fail_next: u32,
        deferred: bool,
        updating: bool,
        buffered: Option<(Duration, Duration)>,
        current: Duration,
        removed: Vec<(Duration, Duration)>,
    }

    impl PlaybackSink for MockSink {
        fn append(&mut self, fragment: &Bytes) -> Result<Completion, AppendError> {
            assert!(!self.updating, "append while sink is updating");
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(AppendError::Rejected("decode error".to_string()));
            }
            self.appended.push(fragment[0]);
            if self.deferred {
                self.updating = true;
                Ok(Completion::Pending)
            } else {
                Ok(Completion::Immediate)
            }
        }

        fn is_updating(&self) -> bool {
            self.updating
        }

        fn buffered_range(&self) -> Option<(Duration, Duration)> {
            self.buffered
        }

        fn current_time(&self) -> Duration {
            self.current
        }

        fn remove(&mut self, start: Duration, end: Duration) -> Result<Completion, AppendError> {
            self.removed.push((start, end));
            Ok(Completion::Immediate)
        }
    }

    fn buffer(sink: MockSink) -> IngestBuffer<MockSink> {
        IngestBuffer::new(sink, IngestConfig::default())
    }

    fn fragment(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 8])
    }

    #[test]
    fn test_idle_sink_commits_immediately() {
        let mut ingest = buffer(MockSink::default());

        assert_eq!(ingest.on_fragment_arrived(fragment(1)), CommitOutcome::Idle);
        assert_eq!(ingest.on_fragment_arrived(fragment(2)), CommitOutcome::Idle);

        assert_eq!(ingest.sink().appended, vec![1, 2]);
        assert!(ingest.init_seen());
        assert!(ingest.last_append_at().is_some());
    }

    #[test]
    fn test_pending_append_blocks_next_until_ready() {
        let mut ingest = buffer(MockSink {
            deferred: true,
            ..Default::default()
        });

        assert_eq!(
            ingest.on_fragment_arrived(fragment(1)),
            CommitOutcome::AwaitingSink
        );
        assert_eq!(
            ingest.on_fragment_arrived(fragment(2)),
            CommitOutcome::AwaitingSink
        );
        assert_eq!(ingest.sink().appended, vec![1]);
        assert_eq!(ingest.queue_len(), 1);

        ingest.sink_mut().updating = false;
        assert_eq!(ingest.on_sink_ready(), CommitOutcome::AwaitingSink);
        assert_eq!(ingest.sink().appended, vec![1, 2]);
        assert_eq!(ingest.queue_len(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest_half() {
        let mut ingest = buffer(MockSink {
            deferred: true,
            ..Default::default()
        });

        // First fragment goes in flight, the next eleven queue up.
        for tag in 0..12 {
            ingest.on_fragment_arrived(fragment(tag));
        }

        assert_eq!(ingest.queue_len(), 6);
        assert_eq!(ingest.stats().dropped_overflow, 5);

        ingest.sink_mut().deferred = false;
        ingest.sink_mut().updating = false;
        ingest.on_sink_ready();
        assert_eq!(ingest.sink().appended, vec![0, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_failed_append_is_retried_without_dropping() {
        let mut ingest = buffer(MockSink {
            fail_next: 2,
            ..Default::default()
        });

        assert_eq!(
            ingest.on_fragment_arrived(fragment(1)),
            CommitOutcome::RetryScheduled(Duration::from_millis(50))
        );
        assert_eq!(
            ingest.on_fragment_arrived(fragment(2)),
            CommitOutcome::RetryPending
        );
        assert_eq!(ingest.consecutive_errors(), 1);

        assert!(matches!(
            ingest.on_retry_timer(),
            CommitOutcome::RetryScheduled(_)
        ));
        assert_eq!(ingest.on_retry_timer(), CommitOutcome::Idle);

        assert_eq!(ingest.sink().appended, vec![1, 2]);
        assert_eq!(ingest.consecutive_errors(), 0);
    }

    #[test]
    fn test_error_budget_flushes_queue_and_resets() {
        let config = IngestConfig {
            max_chunk_errors: 3,
            ..Default::default()
        };
        let mut ingest = IngestBuffer::new(
            MockSink {
                fail_next: 3,
                ..Default::default()
            },
            config,
        );

        ingest.on_fragment_arrived(fragment(1));
        ingest.on_fragment_arrived(fragment(2));
        ingest.on_retry_timer();
        assert_eq!(
            ingest.on_retry_timer(),
            CommitOutcome::Flushed { dropped: 2 }
        );
        assert_eq!(ingest.consecutive_errors(), 0);
        assert_eq!(ingest.queue_len(), 0);

        assert_eq!(ingest.on_fragment_arrived(fragment(3)), CommitOutcome::Idle);
        assert_eq!(ingest.sink().appended, vec![3]);
    }

    #[test]
    fn test_maintenance_trims_beyond_retention() {
        let mut ingest = buffer(MockSink {
            buffered: Some((Duration::from_secs(0), Duration::from_secs(31))),
            current: Duration::from_secs(30),
            ..Default::default()
        });

        assert_eq!(
            ingest.on_maintenance_tick(),
            MaintenanceOutcome::Trimmed {
                start: Duration::from_secs(0),
                end: Duration::from_secs(20)
            }
        );
        assert_eq!(ingest.stats().trims, 1);
    }

    #[test]
    fn test_maintenance_waits_for_idle_error_free_sink() {
        let mut ingest = buffer(MockSink {
            buffered: Some((Duration::from_secs(0), Duration::from_secs(31))),
            current: Duration::from_secs(30),
            fail_next: 1,
            ..Default::default()
        });

        ingest.on_fragment_arrived(fragment(1));
        assert_eq!(ingest.on_maintenance_tick(), MaintenanceOutcome::Skipped);

        ingest.on_retry_timer();
        ingest.sink_mut().current = Duration::from_secs(15);
        assert_eq!(
            ingest.on_maintenance_tick(),
            MaintenanceOutcome::NothingToTrim
        );
        assert!(ingest.sink().removed.is_empty());
    }
}
