//! End-to-end tests of the streaming endpoint over a real socket.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gridcast_core::config::GridcastConfig;
use gridcast_core::encoder::{EncoderBackend, PipelineSpec};
use gridcast_web::AppState;
use gridcast_web::server::serve;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Encoder stand-in that emits an `ftyp` box and idles.
struct FtypBackend;

impl EncoderBackend for FtypBackend {
    fn name(&self) -> &str {
        "ftyp"
    }

    fn command(&self, _spec: &PipelineSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r"printf '\000\000\000\030ftypisom\000\000\002\000'; exec sleep 30");
        cmd
    }
}

struct ServerFixture {
    address: String,
    state: AppState,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerFixture {
    async fn start() -> Self {
        let mut config = GridcastConfig::for_testing();
        config.liveness.ping_interval = Duration::from_secs(60);
        let state = AppState::new(config, Arc::new(FtypBackend));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let state = state.clone();
            async move {
                serve(listener, state, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
            }
        });

        Self {
            address,
            state,
            stop: Some(stop),
            server,
        }
    }

    fn url(&self, query: &str) -> String {
        format!("ws://{}/stream?{}", self.address, query)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

async fn next_message<S>(socket: &mut S) -> Message
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a message")
        .expect("socket ended")
        .unwrap()
}

#[tokio::test]
async fn test_stream_delivers_init_segment() {
    let fixture = ServerFixture::start().await;
    let (mut socket, _) = connect_async(fixture.url("sourceIds=a,b,c,d,e,f&format=mp4"))
        .await
        .unwrap();

    socket
        .send(Message::Text(r#"{"type":"request_init"}"#.into()))
        .await
        .unwrap();

    let first = loop {
        match next_message(&mut socket).await {
            Message::Binary(data) => break data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    };
    assert_eq!(&first[4..8], b"ftyp");

    let sessions = fixture.state.registry.list().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].sources.len(), 6);

    socket.close(None).await.unwrap();
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_invalid_parameters_are_closed_with_policy_violation() {
    let fixture = ServerFixture::start().await;
    let (mut socket, _) = connect_async(fixture.url("sourceIds=a,b")).await.unwrap();

    match next_message(&mut socket).await {
        Message::Text(text) => {
            let message: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(message["type"], "error");
            assert_eq!(message["source"], "websocket");
        }
        other => panic!("expected error text, got {other:?}"),
    }

    match next_message(&mut socket).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(fixture.state.supervisor.stats().started, 0);
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_live_sessions_with_going_away() {
    let fixture = ServerFixture::start().await;
    let (mut socket, _) = connect_async(fixture.url("sourceIds=a,b,c,d,e,f"))
        .await
        .unwrap();
    socket
        .send(Message::Text(r#"{"type":"request_init"}"#.into()))
        .await
        .unwrap();
    loop {
        if let Message::Binary(_) = next_message(&mut socket).await {
            break;
        }
    }

    let supervisor = Arc::clone(&fixture.state.supervisor);
    let stop = async {
        loop {
            if let Message::Close(frame) = next_message(&mut socket).await {
                return frame.map(|frame| u16::from(frame.code));
            }
        }
    };
    let (code, ()) = tokio::join!(stop, fixture.shutdown());

    assert_eq!(code, Some(1001));
    assert_eq!(supervisor.stats().alive(), 0);
}
