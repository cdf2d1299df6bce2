//! Wire schema for the streaming connection: connection parameters,
//! control messages, server messages and close codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoder::SourceId;
use crate::streaming::OutputFormat;

/// Reasons a connection is rejected before any encoder starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("Missing required parameter: sourceIds")]
    MissingSourceIds,

    #[error("Expected exactly {expected} source ids, got {actual}")]
    WrongSourceCount { expected: usize, actual: usize },

    #[error("Invalid source id: '{0}'")]
    InvalidSourceId(String),

    #[error("Unsupported format: '{0}'. Valid options are: mp4, webm")]
    UnsupportedFormat(String),
}

/// Status code sent when the server closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCode {
    Normal,
    /// Server is shutting down
    GoingAway,
    /// Missing or invalid connection parameters; retrying cannot succeed
    PolicyViolation,
    /// The encoder could not be started
    InternalError,
    NoHeartbeat,
    UpstreamFailure,
    ResourceExhausted,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::NoHeartbeat => 4000,
            CloseCode::UpstreamFailure => 4001,
            CloseCode::ResourceExhausted => 4002,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1008 => CloseCode::PolicyViolation,
            1011 => CloseCode::InternalError,
            4000 => CloseCode::NoHeartbeat,
            4001 => CloseCode::UpstreamFailure,
            4002 => CloseCode::ResourceExhausted,
            _ => return None,
        })
    }

    /// Whether reconnecting with the same parameters may succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, CloseCode::PolicyViolation)
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.as_u16(), self)
    }
}

/// Client to server control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    RequestInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<OutputFormat>,
    },
    Ping {
        timestamp: f64,
    },
    SwitchToDegradedMode,
}

impl ControlMessage {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// - `serde_json::Error` - Not JSON, unknown tag or wrong field types
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Subsystem a server error or warning originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSource {
    #[serde(rename = "rtsp")]
    Rtsp,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
    #[serde(rename = "ffmpeg-stderr")]
    FfmpegStderr,
    #[serde(rename = "ffmpeg-exit")]
    FfmpegExit,
    #[serde(rename = "websocket")]
    Websocket,
}

/// Server to client text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Error {
        source: ErrorSource,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Warning {
        source: ErrorSource,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pong {
        timestamp: f64,
    },
}

impl ServerMessage {
    pub fn error(source: ErrorSource, message: impl Into<String>, detail: Option<String>) -> Self {
        ServerMessage::Error {
            source,
            message: message.into(),
            detail,
        }
    }

    pub fn warning(source: ErrorSource, message: impl Into<String>, detail: Option<String>) -> Self {
        ServerMessage::Warning {
            source,
            message: message.into(),
            detail,
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant holds only strings, numbers and unit enums.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Raw query string of the streaming endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "sourceIds")]
    pub source_ids: Option<String>,
    pub format: Option<String>,
}

/// Validated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub sources: Vec<SourceId>,
    pub format: OutputFormat,
}

impl ConnectionParams {
    /// Validates the query against the configured source cardinality.
    ///
    /// # Errors
    ///
    /// - `ParamError::MissingSourceIds` - `sourceIds` absent or empty
    /// - `ParamError::InvalidSourceId` - An entry is blank or malformed
    /// - `ParamError::WrongSourceCount` - Not exactly `expected_count` ids
    /// - `ParamError::UnsupportedFormat` - Unknown `format` value
    pub fn parse(query: &StreamQuery, expected_count: usize) -> Result<Self, ParamError> {
        let raw = query
            .source_ids
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or(ParamError::MissingSourceIds)?;

        let sources = raw
            .split(',')
            .map(|id| SourceId::new(id).ok_or_else(|| ParamError::InvalidSourceId(id.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        if sources.len() != expected_count {
            return Err(ParamError::WrongSourceCount {
                expected: expected_count,
                actual: sources.len(),
            });
        }

        let format = match query.format.as_deref().map(str::trim) {
            None | Some("") => OutputFormat::default(),
            Some(name) => name
                .parse()
                .map_err(|_| ParamError::UnsupportedFormat(name.to_string()))?,
        };

        Ok(Self { sources, format })
    }
}
