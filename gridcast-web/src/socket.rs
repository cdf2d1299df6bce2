//! Adapts an axum WebSocket to the session's transport-agnostic frames.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt, future};
use gridcast_core::session::{ConnectionParams, ParamError, SessionContext, run_session};
use gridcast_core::streaming::{Inbound, Outbound, OutboundReceiver, outbound_channel};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long the writer may keep flushing after the session ended.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Runs one session over an upgraded socket until it ends.
pub async fn serve_socket(
    socket: WebSocket,
    ctx: SessionContext,
    params: Result<ConnectionParams, ParamError>,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (sink, outbound) = outbound_channel();
    let mut writer = tokio::spawn(write_frames(ws_tx, outbound));

    let inbound = ws_rx.filter_map(|message| future::ready(inbound_frame(message)));
    let summary = run_session(ctx, params, inbound, sink).await;
    debug!(
        session_id = %summary.session_id,
        duration_ms = summary.duration.as_millis() as u64,
        "Socket session finished"
    );

    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!(session_id = %summary.session_id, "Socket writer did not drain, aborting");
        writer.abort();
    }
}

/// Writes queued frames in order, settling each once it left the socket.
async fn write_frames(mut ws_tx: SplitSink<WebSocket, Message>, mut outbound: OutboundReceiver) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Outbound::Close { .. });
        let sent = ws_tx.send(outbound_message(&frame)).await;
        outbound.settle(&frame);

        if let Err(e) = sent {
            debug!("WebSocket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
}

fn inbound_frame(message: Result<Message, axum::Error>) -> Option<Inbound> {
    match message {
        Ok(Message::Text(text)) => Some(Inbound::Text(text.to_string())),
        Ok(Message::Binary(data)) => Some(Inbound::Binary(data)),
        Ok(Message::Pong(_)) => Some(Inbound::Pong),
        // axum answers pings itself
        Ok(Message::Ping(_)) => None,
        Ok(Message::Close(_)) => Some(Inbound::Closed),
        Err(e) => {
            debug!("WebSocket read failed: {}", e);
            Some(Inbound::Closed)
        }
    }
}

fn outbound_message(frame: &Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.clone().into()),
        Outbound::Binary(data) => Message::Binary(data.clone()),
        Outbound::Ping => Message::Ping(Bytes::new()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: code.as_u16(),
            reason: reason.clone().into(),
        })),
    }
}
