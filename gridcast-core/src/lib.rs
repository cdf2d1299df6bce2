//! Gridcast Core - multi-camera grid streaming
//!
//! This crate provides the building blocks for streaming a composited grid
//! of RTSP cameras to a browser: encoder process supervision, lossy stream
//! multiplexing, the per-connection session protocol, the session registry
//! and the client-side ingest buffer.

pub mod client;
pub mod config;
pub mod encoder;
pub mod registry;
pub mod session;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{ConfigError, GridcastConfig};
pub use encoder::{EncoderError, EncoderSupervisor, FfmpegBackend, SourceId};
pub use registry::{RegistryError, RegistryHandle, spawn_registry};
pub use session::{CloseCode, ParamError, SessionContext, run_session};
pub use streaming::{MuxError, OutputFormat};

use client::IngestError;

/// Core errors that can bubble up from any Gridcast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum GridcastError {
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Invalid connection parameters: {0}")]
    Params(#[from] ParamError),

    #[error("Stream error: {0}")]
    Mux(#[from] MuxError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridcastError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            GridcastError::Encoder(e) => match e {
                EncoderError::WrongSourceCount { expected, actual } => {
                    format!("Expected {expected} cameras, got {actual}")
                }
                EncoderError::Spawn { program, .. } => {
                    format!("Could not start the encoder ({program}); is it installed?")
                }
                _ => "Encoder error occurred".to_string(),
            },
            GridcastError::Params(e) => e.to_string(),
            GridcastError::Mux(_) => "Connection to the viewer was lost".to_string(),
            GridcastError::Ingest(_) => "Playback buffer error occurred".to_string(),
            GridcastError::Registry(_) => "Session bookkeeping error occurred".to_string(),
            GridcastError::Config(e) => e.to_string(),
            GridcastError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GridcastError::Params(_)
                | GridcastError::Config(_)
                | GridcastError::Encoder(EncoderError::WrongSourceCount { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, GridcastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let params: GridcastError = ParamError::MissingSourceIds.into();
        assert!(params.is_user_error());
        assert_eq!(params.user_message(), "Missing required parameter: sourceIds");

        let count: GridcastError = EncoderError::WrongSourceCount {
            expected: 6,
            actual: 4,
        }
        .into();
        assert!(count.is_user_error());
        assert_eq!(count.user_message(), "Expected 6 cameras, got 4");

        let registry: GridcastError = RegistryError::ActorShutdown.into();
        assert!(!registry.is_user_error());
    }
}
