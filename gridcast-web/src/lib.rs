//! Gridcast Web - WebSocket streaming server
//!
//! Serves the camera grid stream over a WebSocket endpoint and exposes a
//! small JSON API describing live sessions.

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]

pub mod handlers;
pub mod server;
pub mod socket;

// Re-export main types
pub use server::{AppState, WebError, build_router, run_server};
