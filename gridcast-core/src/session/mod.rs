//! Server-side session handling: wire protocol, lifecycle state machine,
//! heartbeat and the per-connection driver.

pub mod driver;
pub mod liveness;
pub mod protocol;
pub mod state;

pub use driver::{SessionContext, SessionSummary, run_session};
pub use liveness::{Heartbeat, HeartbeatAction};
pub use protocol::{
    CloseCode, ConnectionParams, ControlMessage, ErrorSource, ParamError, ServerMessage,
    StreamQuery,
};
pub use state::{SessionAction, SessionEvent, SessionMode, SessionState, transition};
