//! Client side of the stream: ingest buffer, its actor and connection status.

pub mod actor;
pub mod ingest;
pub mod sink;
pub mod status;

pub use actor::{IngestEvent, IngestHandle, spawn_ingest};
pub use ingest::{CommitOutcome, IngestBuffer, IngestError, IngestStats, MaintenanceOutcome};
pub use sink::{AppendError, Completion, PlaybackSink};
pub use status::{ClientFrame, ClientStep, ConnectionStatus, ReconnectAdvice, StreamClient};
