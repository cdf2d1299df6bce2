//! HTTP request handlers organized by functionality

pub mod api;
pub mod stream;

// Re-export handler functions
pub use api::{ApiError, api_sessions, health};
pub use stream::stream_handler;
