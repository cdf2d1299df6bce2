//! Command definitions for the session registry actor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::RegistryError;
use crate::encoder::SourceId;
use crate::session::SessionMode;
use crate::streaming::OutputFormat;

/// Commands accepted by the registry actor.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Adds a live session and the trigger that asks it to close
    Register {
        registration: Registration,
        shutdown: oneshot::Sender<()>,
        responder: oneshot::Sender<Result<(), RegistryError>>,
    },
    /// Records the session's current encoder process
    UpdateEncoder {
        session_id: Uuid,
        pid: Option<u32>,
        mode: SessionMode,
    },
    /// Removes a session; responds whether it was present
    Deregister {
        session_id: Uuid,
        responder: oneshot::Sender<bool>,
    },
    List {
        responder: oneshot::Sender<Vec<SessionInfo>>,
    },
    /// Fires every shutdown trigger; responds with the number signalled
    ShutdownAll { responder: oneshot::Sender<usize> },
}

/// What a session reports about itself when registering.
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_id: Uuid,
    pub sources: Vec<SourceId>,
    pub format: OutputFormat,
}

/// Public view of one registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub sources: Vec<SourceId>,
    pub format: OutputFormat,
    pub mode: SessionMode,
    pub encoder_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}
