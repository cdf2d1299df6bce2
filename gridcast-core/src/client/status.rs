//! Client connection status and reconnect advice.
//!
//! The client never reconnects on its own. When a connection ends it reports
//! a [`ReconnectAdvice`] and leaves the decision to the caller.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::actor::IngestHandle;
use crate::session::{CloseCode, ServerMessage};

/// Connection status a UI can render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What the caller may do after a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAdvice {
    /// Closed normally; nothing to recover
    NotNeeded,
    /// Transient failure; reconnecting with the same parameters may work
    Retry,
    /// Resources ran out; reconnect and ask for degraded mode
    RetryDegraded,
    /// The server rejected the parameters; retrying cannot succeed
    DoNotRetry,
}

impl ReconnectAdvice {
    /// Advice for a close frame's status code, `None` when the transport dropped.
    pub fn for_close(code: Option<u16>) -> Self {
        let Some(code) = code else {
            return ReconnectAdvice::Retry;
        };
        match CloseCode::from_u16(code) {
            Some(CloseCode::Normal) => ReconnectAdvice::NotNeeded,
            Some(CloseCode::ResourceExhausted) => ReconnectAdvice::RetryDegraded,
            Some(code) if !code.is_retryable() => ReconnectAdvice::DoNotRetry,
            _ => ReconnectAdvice::Retry,
        }
    }
}

/// Transport events seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Opened,
    Text(String),
    Binary(Bytes),
    Closed { code: Option<u16>, reason: String },
    /// The transport failed without a close handshake
    Failed(String),
}

/// Whether the connection is still usable after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStep {
    Continue,
    Finished(ReconnectAdvice),
}

/// Maps transport events onto [`ConnectionStatus`] and feeds media into the ingest actor.
pub struct StreamClient {
    status: watch::Sender<ConnectionStatus>,
    ingest: IngestHandle,
    last_error: Option<ServerMessage>,
    fragments: u64,
}

impl StreamClient {
    pub fn new(ingest: IngestHandle) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status, receiver) = watch::channel(ConnectionStatus::Disconnected);
        (
            Self {
                status,
                ingest,
                last_error: None,
                fragments: 0,
            },
            receiver,
        )
    }

    /// Marks a connection attempt as started.
    pub fn connecting(&self) {
        self.set_status(ConnectionStatus::Connecting);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Last error message the server sent, if any.
    pub fn last_error(&self) -> Option<&ServerMessage> {
        self.last_error.as_ref()
    }

    pub fn fragments_received(&self) -> u64 {
        self.fragments
    }

    pub async fn on_frame(&mut self, frame: ClientFrame) -> ClientStep {
        match frame {
            ClientFrame::Opened => {
                self.set_status(ConnectionStatus::Connected);
                ClientStep::Continue
            }
            ClientFrame::Text(text) => {
                self.on_server_message(&text);
                ClientStep::Continue
            }
            ClientFrame::Binary(fragment) => {
                self.fragments += 1;
                if let Err(e) = self.ingest.push(fragment).await {
                    warn!("Dropping fragment: {}", e);
                }
                ClientStep::Continue
            }
            ClientFrame::Closed { code, reason } => {
                let advice = ReconnectAdvice::for_close(code);
                let status = if advice == ReconnectAdvice::NotNeeded {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Error
                };
                info!(?code, %reason, ?advice, "Connection closed");
                self.set_status(status);
                ClientStep::Finished(advice)
            }
            ClientFrame::Failed(reason) => {
                warn!(%reason, "Connection failed");
                self.set_status(ConnectionStatus::Error);
                ClientStep::Finished(ReconnectAdvice::Retry)
            }
        }
    }

    fn on_server_message(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Pong { timestamp }) => trace!(timestamp, "Pong received"),
            Ok(message @ ServerMessage::Warning { .. }) => {
                debug!(?message, "Server warning");
            }
            Ok(message @ ServerMessage::Error { .. }) => {
                warn!(?message, "Server error");
                self.last_error = Some(message);
                self.set_status(ConnectionStatus::Error);
            }
            Err(e) => warn!("Ignoring unparseable server message: {}", e),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "Connection status changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{IngestBuffer, spawn_ingest};
    use crate::client::sink::{AppendError, Completion, PlaybackSink};
    use crate::config::IngestConfig;
    use std::time::Duration;

    struct NullSink;

    impl PlaybackSink for NullSink {
        fn append(&mut self, _fragment: &Bytes) -> Result<Completion, AppendError> {
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

    fn client() -> (StreamClient, watch::Receiver<ConnectionStatus>) {
        let ingest = spawn_ingest(IngestBuffer::new(NullSink, IngestConfig::default()));
        StreamClient::new(ingest)
    }

    #[test]
    fn test_reconnect_advice_by_close_code() {
        assert_eq!(ReconnectAdvice::for_close(Some(1000)), ReconnectAdvice::NotNeeded);
        assert_eq!(ReconnectAdvice::for_close(Some(1008)), ReconnectAdvice::DoNotRetry);
        assert_eq!(ReconnectAdvice::for_close(Some(4001)), ReconnectAdvice::Retry);
        assert_eq!(
            ReconnectAdvice::for_close(Some(4002)),
            ReconnectAdvice::RetryDegraded
        );
        assert_eq!(ReconnectAdvice::for_close(None), ReconnectAdvice::Retry);
        assert_eq!(ReconnectAdvice::for_close(Some(3999)), ReconnectAdvice::Retry);
    }

    #[tokio::test]
    async fn test_status_follows_connection_lifecycle() {
        let (mut client, status) = client();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);

        client.connecting();
        assert_eq!(*status.borrow(), ConnectionStatus::Connecting);

        client.on_frame(ClientFrame::Opened).await;
        assert_eq!(*status.borrow(), ConnectionStatus::Connected);

        client
            .on_frame(ClientFrame::Binary(Bytes::from_static(b"ftyp")))
            .await;
        assert_eq!(client.fragments_received(), 1);

        let step = client
            .on_frame(ClientFrame::Closed {
                code: Some(1000),
                reason: String::new(),
            })
            .await;
        assert_eq!(step, ClientStep::Finished(ReconnectAdvice::NotNeeded));
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_server_error_sets_error_status() {
        let (mut client, status) = client();
        client.on_frame(ClientFrame::Opened).await;

        client
            .on_frame(ClientFrame::Text(
                r#"{"type":"error","source":"rtsp","message":"Camera source 'cam3' is unavailable"}"#
                    .to_string(),
            ))
            .await;

        assert_eq!(*status.borrow(), ConnectionStatus::Error);
        assert!(matches!(
            client.last_error(),
            Some(ServerMessage::Error { .. })
        ));

        let step = client
            .on_frame(ClientFrame::Closed {
                code: Some(1008),
                reason: "bad params".to_string(),
            })
            .await;
        assert_eq!(step, ClientStep::Finished(ReconnectAdvice::DoNotRetry));
    }
}
