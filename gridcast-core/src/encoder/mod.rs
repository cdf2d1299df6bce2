//! Encoder supervision: pipeline construction, process lifecycle,
//! diagnostic classification and degraded-mode rotation.

pub mod diagnostics;
pub mod pipeline;
pub mod rotation;
pub mod supervisor;

pub use diagnostics::{DiagnosticClass, classify};
pub use pipeline::{GridLayout, PipelineSpec, SourceId};
pub use rotation::RotationPlan;
pub use supervisor::{
    EncoderBackend, EncoderError, EncoderEvent, EncoderHandle, EncoderSupervisor, ExitInfo,
    FatalDiagnostic, FatalKind, FfmpegBackend, SupervisorSnapshot, SupervisorStats,
};
