//! Headless stream client
//!
//! Connects to a Gridcast server, requests the stream and feeds every
//! fragment through the ingest buffer into a [`FilePlaybackSink`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use gridcast_core::client::{
    ClientFrame, ClientStep, IngestBuffer, IngestStats, ReconnectAdvice, StreamClient,
    spawn_ingest,
};
use gridcast_core::config::IngestConfig;
use gridcast_core::session::{ControlMessage, ServerMessage};
use gridcast_core::streaming::OutputFormat;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::playback::FilePlaybackSink;

/// How long to wait for the server to answer our close frame.
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// What to watch and where to put it.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub server: Url,
    pub stream_path: String,
    pub source_ids: String,
    pub format: OutputFormat,
    pub degraded: bool,
    pub output: PathBuf,
    /// Assumed media byte rate for the synthetic playback clock
    pub byte_rate: u64,
    pub duration: Option<Duration>,
    pub ingest: IngestConfig,
}

/// Outcome of one watch run.
#[derive(Debug)]
pub struct WatchReport {
    pub advice: ReconnectAdvice,
    pub fragments_received: u64,
    pub ingest: IngestStats,
    pub last_error: Option<ServerMessage>,
}

/// Builds the WebSocket URL for the streaming endpoint.
///
/// # Errors
///
/// - `url::ParseError` - The stream path cannot be joined onto the server URL
pub fn stream_url(options: &WatchOptions) -> Result<Url, url::ParseError> {
    let mut url = options.server.join(&options.stream_path)?;
    url.query_pairs_mut()
        .append_pair("sourceIds", &options.source_ids)
        .append_pair("format", &options.format.to_string());
    Ok(url)
}

/// Watches one connection until the server closes it, the duration elapses
/// or Ctrl-C is pressed.
///
/// # Errors
///
/// - `anyhow::Error` - The output file or URL is invalid, or the ingest actor stopped
pub async fn watch(options: WatchOptions) -> anyhow::Result<WatchReport> {
    let url = stream_url(&options).context("invalid server URL")?;
    let sink = FilePlaybackSink::create(&options.output, options.byte_rate)
        .with_context(|| format!("cannot create {}", options.output.display()))?;
    let ingest = spawn_ingest(IngestBuffer::new(sink, options.ingest.clone()));
    let (mut client, mut status) = StreamClient::new(ingest.clone());

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!(status = ?*status.borrow(), "Connection status");
        }
    });

    client.connecting();
    let advice = match connect_async(url.as_str()).await {
        Ok((socket, _)) => {
            client.on_frame(ClientFrame::Opened).await;
            run_connection(socket, &mut client, &options).await
        }
        Err(e) => finish(&mut client, ClientFrame::Failed(e.to_string())).await,
    };

    let stats = ingest.shutdown().await?;
    Ok(WatchReport {
        advice,
        fragments_received: client.fragments_received(),
        ingest: stats,
        last_error: client.last_error().cloned(),
    })
}

async fn run_connection<S>(
    mut socket: S,
    client: &mut StreamClient,
    options: &WatchOptions,
) -> ReconnectAdvice
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let mut requests = vec![ControlMessage::RequestInit {
        format: Some(options.format),
    }];
    if options.degraded {
        requests.push(ControlMessage::SwitchToDegradedMode);
    }
    for request in requests {
        if let Err(e) = socket.send(Message::Text(request.to_json().into())).await {
            return finish(client, ClientFrame::Failed(e.to_string())).await;
        }
    }

    let deadline = options.duration.map(|duration| Instant::now() + duration);
    let mut close_deadline: Option<Instant> = None;

    loop {
        let stopping = close_deadline.is_some();
        let step = tokio::select! {
            message = socket.next() => Step::Frame(client_frame(message)),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !stopping => {
                Step::Stop("Watch duration elapsed")
            }
            _ = tokio::signal::ctrl_c(), if !stopping => Step::Stop("Interrupted"),
            _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if stopping => {
                Step::CloseTimedOut
            }
        };

        match step {
            Step::Frame(Some(frame)) => {
                if let ClientStep::Finished(advice) = client.on_frame(frame).await {
                    return advice;
                }
            }
            Step::Frame(None) => {}
            Step::Stop(reason) => {
                info!("{}, closing", reason);
                close_deadline = Some(Instant::now() + CLOSE_REPLY_TIMEOUT);
                close(&mut socket).await;
            }
            Step::CloseTimedOut => {
                warn!(timeout = ?CLOSE_REPLY_TIMEOUT, "Server did not answer the close frame");
                let frame = ClientFrame::Closed {
                    code: Some(u16::from(WsCloseCode::Normal)),
                    reason: "close reply timed out".to_string(),
                };
                return finish(client, frame).await;
            }
        }
    }
}

enum Step {
    Frame(Option<ClientFrame>),
    Stop(&'static str),
    CloseTimedOut,
}

async fn finish(client: &mut StreamClient, frame: ClientFrame) -> ReconnectAdvice {
    match client.on_frame(frame).await {
        ClientStep::Finished(advice) => advice,
        ClientStep::Continue => ReconnectAdvice::Retry,
    }
}

async fn close<S>(socket: &mut S)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = CloseFrame {
        code: WsCloseCode::Normal,
        reason: "viewer stopped".into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// Maps a socket read onto a client frame; `None` for frames the client ignores.
fn client_frame(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<ClientFrame> {
    match message {
        Some(Ok(Message::Text(text))) => Some(ClientFrame::Text(text.to_string())),
        Some(Ok(Message::Binary(data))) => Some(ClientFrame::Binary(data)),
        Some(Ok(Message::Close(frame))) => Some(ClientFrame::Closed {
            code: frame.as_ref().map(|frame| u16::from(frame.code)),
            reason: frame
                .map(|frame| frame.reason.to_string())
                .unwrap_or_default(),
        }),
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => None,
        Some(Err(e)) => {
            warn!("WebSocket error: {}", e);
            Some(ClientFrame::Failed(e.to_string()))
        }
        None => Some(ClientFrame::Failed("connection ended without a close frame".to_string())),
    }
}
