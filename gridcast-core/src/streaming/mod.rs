//! Server-side media delivery: output formats, the socket transport seam
//! and the lossy multiplexer that forwards encoder output to one client.

pub mod multiplexer;
pub mod transport;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use multiplexer::{ForwardOutcome, MediaSink, MuxError, MuxStats, Multiplexer};
pub use transport::{Inbound, Outbound, OutboundReceiver, OutboundSink, SinkClosed, outbound_channel};

/// Encoded output container selected per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Fragmented MP4 (H.264), appendable segment by segment
    #[default]
    #[serde(alias = "fmp4", alias = "fragmented-mp4")]
    Mp4,
    /// WebM (VP8) clusters
    Webm,
}

impl OutputFormat {
    /// Container name as understood by the encoder's `-f` flag.
    pub fn muxer_name(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
        }
    }

    /// Returns true when `bytes` begins with this format's initialization segment.
    pub fn starts_init_segment(self, bytes: &[u8]) -> bool {
        match self {
            OutputFormat::Mp4 => bytes.len() >= 8 && &bytes[4..8] == b"ftyp",
            OutputFormat::Webm => bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp4" | "fmp4" | "fragmented-mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            other => Err(format!(
                "Unsupported output format: '{other}'. Valid options are: mp4, webm"
            )),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.muxer_name())
    }
}
