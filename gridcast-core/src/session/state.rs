//! Session lifecycle as a pure state machine.
//!
//! [`transition`] maps the current state and one event to the next state and
//! the side effects the driver must perform. It never performs I/O itself.

use serde::{Deserialize, Serialize};

use super::protocol::{CloseCode, ErrorSource, ServerMessage};
use crate::encoder::{ExitInfo, FatalDiagnostic, FatalKind};
use crate::streaming::OutputFormat;

/// Encoder layout a streaming session is using.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// All sources composited at once
    #[default]
    Grid,
    /// Rotating subgroups
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInit,
    Streaming {
        format: OutputFormat,
        mode: SessionMode,
    },
    Closing {
        code: CloseCode,
    },
    Closed {
        code: CloseCode,
    },
    /// Unrecoverable setup failure; absorbing
    Error,
}

impl SessionState {
    /// Closed and Error accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed { .. } | SessionState::Error)
    }

    /// Whether teardown must run before the state can settle.
    pub fn needs_teardown(&self) -> bool {
        matches!(self, SessionState::Closing { .. } | SessionState::Error)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::AwaitingInit => "awaiting_init",
            SessionState::Streaming { .. } => "streaming",
            SessionState::Closing { .. } => "closing",
            SessionState::Closed { .. } => "closed",
            SessionState::Error => "error",
        }
    }
}

/// Inputs to the state machine, already decoded by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `request_init`, with the format resolved against the connection default
    InitRequested { format: OutputFormat },
    /// `switch_to_degraded_mode`; `format` is the connection default
    DegradedRequested { format: OutputFormat },
    PingReceived { timestamp: f64 },
    MalformedMessage { reason: String },
    EncoderDiagnostic { line: String },
    EncoderFatal(FatalDiagnostic),
    EncoderSpawnFailed { reason: String },
    EncoderExited(ExitInfo),
    HeartbeatExpired,
    TransportClosed,
    SendFailed,
    ParametersInvalid { reason: String },
    ShutdownRequested,
    TeardownComplete,
}

/// Side effects requested by [`transition`], executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Start a full-grid encoder, replacing any running one
    StartEncoder { format: OutputFormat },
    /// Start the degraded rotation, replacing any running encoder
    StartRotation { format: OutputFormat },
    StopEncoder,
    Send(ServerMessage),
    /// Send a close frame to the client
    Close { code: CloseCode, reason: String },
    LogMalformed { reason: String },
}

/// Computes the next state and the actions that realise it.
pub fn transition(state: SessionState, event: SessionEvent) -> (SessionState, Vec<SessionAction>) {
    use SessionAction as A;
    use SessionEvent as E;
    use SessionState as S;

    if state.is_terminal() {
        return (state, Vec::new());
    }

    match (state, event) {
        (_, E::ParametersInvalid { reason }) => (
            S::Error,
            vec![
                A::StopEncoder,
                A::Send(ServerMessage::error(
                    ErrorSource::Websocket,
                    "Invalid connection parameters",
                    Some(reason.clone()),
                )),
                A::Close {
                    code: CloseCode::PolicyViolation,
                    reason,
                },
            ],
        ),

        (S::Closing { code }, E::TeardownComplete) => (S::Closed { code }, Vec::new()),
        // Everything else is moot once teardown has begun.
        (S::Closing { .. }, _) => (state, Vec::new()),

        (_, E::MalformedMessage { reason }) => (state, vec![A::LogMalformed { reason }]),

        (_, E::PingReceived { timestamp }) => {
            (state, vec![A::Send(ServerMessage::Pong { timestamp })])
        }

        (S::AwaitingInit, E::InitRequested { format }) => (
            S::Streaming {
                format,
                mode: SessionMode::Grid,
            },
            vec![A::StartEncoder { format }],
        ),
        (S::Streaming { format: current, mode }, E::InitRequested { format }) => {
            if format == current {
                (state, Vec::new())
            } else {
                let action = match mode {
                    SessionMode::Grid => A::StartEncoder { format },
                    SessionMode::Degraded => A::StartRotation { format },
                };
                (S::Streaming { format, mode }, vec![A::StopEncoder, action])
            }
        }

        (S::AwaitingInit, E::DegradedRequested { format }) => (
            S::Streaming {
                format,
                mode: SessionMode::Degraded,
            },
            vec![A::StartRotation { format }],
        ),
        (
            S::Streaming {
                format,
                mode: SessionMode::Grid,
            },
            E::DegradedRequested { .. },
        ) => (
            S::Streaming {
                format,
                mode: SessionMode::Degraded,
            },
            vec![A::StopEncoder, A::StartRotation { format }],
        ),
        (
            S::Streaming {
                mode: SessionMode::Degraded,
                ..
            },
            E::DegradedRequested { .. },
        ) => (state, Vec::new()),

        (S::Streaming { .. }, E::EncoderDiagnostic { line }) => (
            state,
            vec![A::Send(ServerMessage::warning(
                ErrorSource::FfmpegStderr,
                "Encoder reported a problem",
                Some(line),
            ))],
        ),

        (S::Streaming { .. }, E::EncoderFatal(fatal)) => {
            let (source, code, message) = match fatal.kind {
                FatalKind::OutOfMemory => (
                    ErrorSource::Memory,
                    CloseCode::ResourceExhausted,
                    "Encoder ran out of memory".to_string(),
                ),
                FatalKind::Upstream => (
                    ErrorSource::Rtsp,
                    CloseCode::UpstreamFailure,
                    match &fatal.source {
                        Some(id) => format!("Camera source '{id}' is unavailable"),
                        None => "A camera source is unavailable".to_string(),
                    },
                ),
            };
            closing(
                code,
                vec![A::Send(ServerMessage::error(source, message.clone(), Some(fatal.line)))],
                message,
            )
        }

        (S::Streaming { .. }, E::EncoderSpawnFailed { reason }) => closing(
            CloseCode::InternalError,
            vec![A::Send(ServerMessage::error(
                ErrorSource::Ffmpeg,
                "Failed to start encoder",
                Some(reason),
            ))],
            "Failed to start encoder".to_string(),
        ),

        (S::Streaming { .. }, E::EncoderExited(exit)) => closing(
            CloseCode::UpstreamFailure,
            vec![A::Send(ServerMessage::error(
                ErrorSource::FfmpegExit,
                "Encoder exited unexpectedly",
                Some(exit.to_string()),
            ))],
            format!("Encoder exited with {exit}"),
        ),

        (_, E::HeartbeatExpired) => closing(
            CloseCode::NoHeartbeat,
            Vec::new(),
            "No heartbeat received".to_string(),
        ),

        (_, E::ShutdownRequested) => closing(
            CloseCode::GoingAway,
            Vec::new(),
            "Server shutting down".to_string(),
        ),

        // The peer is gone, so no close frame is sent.
        (_, E::TransportClosed | E::SendFailed) => (
            S::Closing {
                code: CloseCode::Normal,
            },
            vec![A::StopEncoder],
        ),

        // Encoder events without a running encoder, and completion before teardown.
        (
            S::AwaitingInit,
            E::EncoderDiagnostic { .. }
            | E::EncoderFatal(_)
            | E::EncoderSpawnFailed { .. }
            | E::EncoderExited(_),
        )
        | (S::AwaitingInit | S::Streaming { .. }, E::TeardownComplete) => (state, Vec::new()),

        (S::Closed { .. } | S::Error, _) => (state, Vec::new()),
    }
}

fn closing(
    code: CloseCode,
    mut actions: Vec<SessionAction>,
    reason: String,
) -> (SessionState, Vec<SessionAction>) {
    actions.push(SessionAction::StopEncoder);
    actions.push(SessionAction::Close { code, reason });
    (SessionState::Closing { code }, actions)
}
