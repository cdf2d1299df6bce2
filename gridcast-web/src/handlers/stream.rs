//! WebSocket upgrade for the grid stream

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::Response;
use gridcast_core::session::{ConnectionParams, StreamQuery};
use tracing::debug;

use crate::server::AppState;
use crate::socket::serve_socket;

/// Upgrades every request, valid or not.
///
/// Rejected parameters are reported over the socket and closed with a
/// policy-violation code so the client can tell them apart from transient
/// failures.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let params = ConnectionParams::parse(&query, state.config.encoder.source_count);
    if let Err(e) = &params {
        debug!(?query, "Stream request with invalid parameters: {}", e);
    }

    let ctx = state.session_context();
    ws.on_upgrade(move |socket| serve_socket(socket, ctx, params))
}
