//! Actor that owns an [`IngestBuffer`] and drives its timers.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};

use super::ingest::{CommitOutcome, IngestBuffer, IngestError, IngestStats};
use super::sink::PlaybackSink;

/// Events delivered to the ingest actor.
#[derive(Debug)]
pub enum IngestEvent {
    Fragment(bytes::Bytes),
    /// The sink finished an operation that completed as pending
    SinkReady,
    Stats {
        responder: oneshot::Sender<IngestStats>,
    },
    Shutdown {
        responder: oneshot::Sender<IngestStats>,
    },
}

/// Cloneable handle to a running ingest actor.
#[derive(Clone, Debug)]
pub struct IngestHandle {
    sender: mpsc::Sender<IngestEvent>,
}

impl IngestHandle {
    /// Hands one arrived fragment to the buffer.
    ///
    /// # Errors
    /// - `IngestError::ActorShutdown` - The actor is no longer running
    pub async fn push(&self, fragment: bytes::Bytes) -> Result<(), IngestError> {
        self.sender
            .send(IngestEvent::Fragment(fragment))
            .await
            .map_err(|_| IngestError::ActorShutdown)
    }

    /// Reports that the sink is ready for the next operation.
    ///
    /// # Errors
    /// - `IngestError::ActorShutdown` - The actor is no longer running
    pub async fn sink_ready(&self) -> Result<(), IngestError> {
        self.sender
            .send(IngestEvent::SinkReady)
            .await
            .map_err(|_| IngestError::ActorShutdown)
    }

    /// # Errors
    /// - `IngestError::ActorShutdown` - The actor is no longer running
    pub async fn stats(&self) -> Result<IngestStats, IngestError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(IngestEvent::Stats { responder })
            .await
            .map_err(|_| IngestError::ActorShutdown)?;
        rx.await.map_err(|_| IngestError::ActorShutdown)
    }

    /// Stops the actor and returns its final counters.
    ///
    /// # Errors
    /// - `IngestError::ActorShutdown` - The actor had already stopped
    pub async fn shutdown(&self) -> Result<IngestStats, IngestError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(IngestEvent::Shutdown { responder })
            .await
            .map_err(|_| IngestError::ActorShutdown)?;
        rx.await.map_err(|_| IngestError::ActorShutdown)
    }
}

/// Spawns the ingest actor.
///
/// Arrivals, readiness signals and timer callbacks are handled one at a time
/// on the actor task, so the buffer is never mutated concurrently.
pub fn spawn_ingest<S>(buffer: IngestBuffer<S>) -> IngestHandle
where
    S: PlaybackSink + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(64);
    let maintenance_interval = buffer.config().maintenance_interval;

    tokio::spawn(async move {
        run_actor_loop(buffer, receiver, maintenance_interval).await;
    });

    IngestHandle { sender }
}

async fn run_actor_loop<S: PlaybackSink>(
    mut buffer: IngestBuffer<S>,
    mut receiver: mpsc::Receiver<IngestEvent>,
    maintenance_interval: std::time::Duration,
) {
    tracing::debug!("Ingest actor started");

    let mut maintenance = interval_at(Instant::now() + maintenance_interval, maintenance_interval);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    loop {
        let retry_deadline = retry_at;
        let outcome = tokio::select! {
            event = receiver.recv() => match event {
                Some(IngestEvent::Fragment(fragment)) => Some(buffer.on_fragment_arrived(fragment)),
                Some(IngestEvent::SinkReady) => Some(buffer.on_sink_ready()),
                Some(IngestEvent::Stats { responder }) => {
                    let _ = responder.send(buffer.stats());
                    None
                }
                Some(IngestEvent::Shutdown { responder }) => {
                    let _ = responder.send(buffer.stats());
                    break;
                }
                None => break,
            },
            _ = sleep_until(retry_deadline.unwrap_or_else(Instant::now)), if retry_deadline.is_some() => {
                retry_at = None;
                Some(buffer.on_retry_timer())
            }
            _ = maintenance.tick() => {
                buffer.on_maintenance_tick();
                None
            }
        };

        if let Some(CommitOutcome::RetryScheduled(delay)) = outcome {
            retry_at = Some(Instant::now() + delay);
        }
    }

    tracing::debug!(stats = ?buffer.stats(), "Ingest actor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::client::sink::{AppendError, Completion};
    use crate::config::IngestConfig;

    /// Rejects the first `failures` appends.
    struct FlakySink {
        failures: u32,
    }

    impl PlaybackSink for FlakySink {
        fn append(&mut self, _fragment: &Bytes) -> Result<Completion, AppendError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(AppendError::Rejected("corrupt fragment".to_string()));
            }
            Ok(Completion::Immediate)
        }

        fn is_updating(&self) -> bool {
            false
        }

        fn buffered_range(&self) -> Option<(Duration, Duration)> {
            None
        }

        fn current_time(&self) -> Duration {
            Duration::ZERO
        }

        fn remove(&mut self, _start: Duration, _end: Duration) -> Result<Completion, AppendError> {
            Ok(Completion::Immediate)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_recommits_failed_fragment() {
        let buffer = IngestBuffer::new(FlakySink { failures: 2 }, IngestConfig::default());
        let handle = spawn_ingest(buffer);

        handle.push(Bytes::from_static(b"init")).await.unwrap();
        handle.push(Bytes::from_static(b"media")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.append_errors, 2);
        assert_eq!(stats.appended, 2);
        assert!(handle.stats().await.is_err());
    }
}
