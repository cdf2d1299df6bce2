//! Per-connection session driver.
//!
//! One task per connection selects over inbound frames, encoder events, the
//! heartbeat interval, the degraded rotation deadline and the registry's
//! shutdown trigger. Every state change goes through [`transition`]; this
//! module only executes the resulting actions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use super::liveness::{Heartbeat, HeartbeatAction};
use super::protocol::{CloseCode, ConnectionParams, ControlMessage, ParamError, ServerMessage};
use super::state::{SessionAction, SessionEvent, SessionMode, SessionState, transition};
use crate::config::{DegradedConfig, GridcastConfig, LivenessConfig, StreamConfig};
use crate::encoder::{EncoderEvent, EncoderHandle, EncoderSupervisor, RotationPlan};
use crate::registry::{Registration, RegistryHandle};
use crate::streaming::{
    ForwardOutcome, Inbound, Multiplexer, MuxError, MuxStats, Outbound, OutboundSink,
    OutputFormat,
};

/// Shared services every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub supervisor: Arc<EncoderSupervisor>,
    pub registry: RegistryHandle,
    pub stream: StreamConfig,
    pub liveness: LivenessConfig,
    pub degraded: DegradedConfig,
}

impl SessionContext {
    pub fn new(
        config: &GridcastConfig,
        supervisor: Arc<EncoderSupervisor>,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            supervisor,
            registry,
            stream: config.stream.clone(),
            liveness: config.liveness.clone(),
            degraded: config.degraded.clone(),
        }
    }
}

/// What happened over a session's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub final_state: SessionState,
    /// Close code sent to the client; `None` when the peer went away first
    pub close_code: Option<CloseCode>,
    pub encoders_started: u32,
    pub mux: MuxStats,
    pub duration: Duration,
}

/// Runs one session to completion over an established connection.
///
/// `inbound` yields the client's frames; everything for the client goes to
/// `sink`. Returns once the session is `Closed` or `Error` and every
/// resource it held has been released.
pub async fn run_session<I>(
    ctx: SessionContext,
    params: Result<ConnectionParams, ParamError>,
    inbound: I,
    sink: OutboundSink,
) -> SessionSummary
where
    I: Stream<Item = Inbound> + Unpin,
{
    let session_id = Uuid::new_v4();
    let span = info_span!("session", %session_id);
    Session::new(session_id, ctx, sink)
        .run(params, inbound)
        .instrument(span)
        .await
}

/// The encoder currently owned by the session.
enum EncoderSlot {
    Idle,
    Grid(EncoderHandle),
    Rotating {
        plan: RotationPlan,
        handle: EncoderHandle,
        format: OutputFormat,
        switch_at: Instant,
    },
}

impl EncoderSlot {
    async fn next_event(&mut self) -> Option<EncoderEvent> {
        match self {
            EncoderSlot::Idle => std::future::pending().await,
            EncoderSlot::Grid(handle) | EncoderSlot::Rotating { handle, .. } => {
                handle.next_event().await
            }
        }
    }

    fn switch_at(&self) -> Option<Instant> {
        match self {
            EncoderSlot::Rotating { switch_at, .. } => Some(*switch_at),
            _ => None,
        }
    }

    fn take_handle(&mut self) -> Option<EncoderHandle> {
        match std::mem::replace(self, EncoderSlot::Idle) {
            EncoderSlot::Idle => None,
            EncoderSlot::Grid(handle) | EncoderSlot::Rotating { handle, .. } => Some(handle),
        }
    }
}

enum Step {
    /// `true` when the registry fired the trigger, `false` when it was dropped
    Shutdown(bool),
    Inbound(Inbound),
    Encoder(Option<EncoderEvent>),
    Heartbeat,
    Rotate,
}

struct Session {
    id: Uuid,
    ctx: SessionContext,
    state: SessionState,
    params: Option<ConnectionParams>,
    sink: OutboundSink,
    mux: Multiplexer<OutboundSink>,
    encoder: EncoderSlot,
    heartbeat: Heartbeat,
    registered: bool,
    torn_down: bool,
    close_code: Option<CloseCode>,
    encoders_started: u32,
    started_at: Instant,
}

impl Session {
    fn new(id: Uuid, ctx: SessionContext, sink: OutboundSink) -> Self {
        let mux = Multiplexer::new(
            sink.clone(),
            ctx.stream.backpressure_threshold,
            OutputFormat::default(),
        );
        let heartbeat = Heartbeat::new(ctx.liveness.ping_interval);
        Self {
            id,
            ctx,
            state: SessionState::AwaitingInit,
            params: None,
            sink,
            mux,
            encoder: EncoderSlot::Idle,
            heartbeat,
            registered: false,
            torn_down: false,
            close_code: None,
            encoders_started: 0,
            started_at: Instant::now(),
        }
    }

    async fn run<I>(
        mut self,
        params: Result<ConnectionParams, ParamError>,
        mut inbound: I,
    ) -> SessionSummary
    where
        I: Stream<Item = Inbound> + Unpin,
    {
        let mut shutdown = match params {
            Ok(params) => {
                info!(
                    sources = params.sources.len(),
                    format = %params.format,
                    "Session opened"
                );
                let shutdown = self.register(&params).await;
                self.params = Some(params);
                shutdown
            }
            Err(e) => {
                warn!("Rejecting connection: {}", e);
                self.process(SessionEvent::ParametersInvalid {
                    reason: e.to_string(),
                })
                .await;
                detached_trigger()
            }
        };
        let mut shutdown_armed = true;

        let period = self.heartbeat.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.state.is_terminal() {
            let switch_at = self.encoder.switch_at();
            let step = tokio::select! {
                biased;
                signal = &mut shutdown, if shutdown_armed => Step::Shutdown(signal.is_ok()),
                frame = inbound.next() => Step::Inbound(frame.unwrap_or(Inbound::Closed)),
                event = self.encoder.next_event() => Step::Encoder(event),
                _ = ticker.tick() => Step::Heartbeat,
                _ = sleep_until(switch_at.unwrap_or_else(Instant::now)), if switch_at.is_some() => Step::Rotate,
            };

            match step {
                Step::Shutdown(fired) => {
                    shutdown_armed = false;
                    if fired {
                        self.process(SessionEvent::ShutdownRequested).await;
                    }
                }
                Step::Inbound(frame) => self.on_inbound(frame).await,
                Step::Encoder(Some(event)) => self.on_encoder_event(event).await,
                Step::Encoder(None) => {
                    // Event stream ended without an exit notice.
                    self.on_encoder_event(EncoderEvent::Exited(Default::default()))
                        .await
                }
                Step::Heartbeat => self.on_heartbeat().await,
                Step::Rotate => self.rotate().await,
            }
        }

        let summary = SessionSummary {
            session_id: self.id,
            final_state: self.state,
            close_code: self.close_code,
            encoders_started: self.encoders_started,
            mux: self.mux.stats(),
            duration: self.started_at.elapsed(),
        };
        info!(
            state = summary.final_state.name(),
            close_code = ?summary.close_code,
            encoders = summary.encoders_started,
            chunks_forwarded = summary.mux.chunks_forwarded,
            chunks_dropped = summary.mux.chunks_dropped,
            "Session ended"
        );
        summary
    }

    async fn register(&mut self, params: &ConnectionParams) -> oneshot::Receiver<()> {
        let registration = Registration {
            session_id: self.id,
            sources: params.sources.clone(),
            format: params.format,
        };
        match self.ctx.registry.register(registration).await {
            Ok(shutdown) => {
                self.registered = true;
                shutdown
            }
            Err(e) => {
                warn!("Session not registered: {}", e);
                detached_trigger()
            }
        }
    }

    fn default_format(&self) -> OutputFormat {
        self.params
            .as_ref()
            .map(|params| params.format)
            .unwrap_or_default()
    }

    async fn on_inbound(&mut self, frame: Inbound) {
        let event = match frame {
            Inbound::Text(text) => match ControlMessage::parse(&text) {
                Ok(ControlMessage::RequestInit { format }) => SessionEvent::InitRequested {
                    format: format.unwrap_or_else(|| self.default_format()),
                },
                Ok(ControlMessage::Ping { timestamp }) => SessionEvent::PingReceived { timestamp },
                Ok(ControlMessage::SwitchToDegradedMode) => SessionEvent::DegradedRequested {
                    format: self.default_format(),
                },
                Err(e) => SessionEvent::MalformedMessage {
                    reason: e.to_string(),
                },
            },
            Inbound::Binary(data) => SessionEvent::MalformedMessage {
                reason: format!("unexpected binary frame of {} bytes", data.len()),
            },
            Inbound::Pong => {
                self.heartbeat.on_pong(Instant::now());
                return;
            }
            Inbound::Closed => SessionEvent::TransportClosed,
        };
        self.process(event).await;
    }

    async fn on_encoder_event(&mut self, event: EncoderEvent) {
        let event = match event {
            EncoderEvent::Chunk(chunk) => {
                match self.mux.forward(chunk) {
                    Ok(ForwardOutcome::Forwarded) => {}
                    Ok(ForwardOutcome::Dropped) => trace!("Chunk dropped under backpressure"),
                    Err(MuxError::SinkClosed) => self.process(SessionEvent::SendFailed).await,
                    Err(MuxError::Released) => {}
                }
                return;
            }
            EncoderEvent::Diagnostic { line } => SessionEvent::EncoderDiagnostic { line },
            EncoderEvent::Fatal(fatal) => SessionEvent::EncoderFatal(fatal),
            EncoderEvent::Exited(exit) => {
                if let Some(handle) = self.encoder.take_handle() {
                    warn!(encoder_id = handle.id(), %exit, "Encoder exited on its own");
                    handle.stop().await;
                }
                SessionEvent::EncoderExited(exit)
            }
        };
        self.process(event).await;
    }

    async fn on_heartbeat(&mut self) {
        match self.heartbeat.on_tick(Instant::now()) {
            HeartbeatAction::SendPing => {
                trace!("Sending heartbeat ping");
                if self.sink.send(Outbound::Ping).is_err() {
                    self.process(SessionEvent::SendFailed).await;
                }
            }
            HeartbeatAction::Expired => {
                warn!(
                    interval = ?self.heartbeat.interval(),
                    "No pong since last ping, closing connection"
                );
                self.process(SessionEvent::HeartbeatExpired).await;
            }
        }
    }

    /// Feeds one event through the state machine and executes the actions,
    /// including follow-up events they raise.
    async fn process(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let before = self.state;
            let (next, actions) = transition(before, event);
            if next != before {
                debug!(from = before.name(), to = next.name(), "Session state changed");
            }
            self.state = next;

            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    pending.push_back(follow_up);
                }
            }

            if self.state.needs_teardown() && !self.torn_down {
                self.teardown().await;
                pending.push_back(SessionEvent::TeardownComplete);
            }
        }
    }

    async fn execute(&mut self, action: SessionAction) -> Option<SessionEvent> {
        match action {
            SessionAction::StartEncoder { format } => self.start_grid(format).await,
            SessionAction::StartRotation { format } => self.start_rotation(format).await,
            SessionAction::StopEncoder => {
                self.stop_encoder().await;
                None
            }
            SessionAction::Send(message) => {
                let frame = Outbound::Text(message.to_json());
                self.sink.send(frame).err().map(|_| SessionEvent::SendFailed)
            }
            SessionAction::Close { code, reason } => {
                self.close_code.get_or_insert(code);
                info!(%code, %reason, "Closing connection");
                let _ = self.sink.send(Outbound::Close { code, reason });
                None
            }
            SessionAction::LogMalformed { reason } => {
                warn!(%reason, "Ignoring malformed control message");
                None
            }
        }
    }

    async fn start_grid(&mut self, format: OutputFormat) -> Option<SessionEvent> {
        self.stop_encoder().await;

        let params = self.params.as_ref()?;
        match self.ctx.supervisor.start(&params.sources, format) {
            Ok(handle) => {
                self.on_encoder_started(&handle, SessionMode::Grid).await;
                self.encoder = EncoderSlot::Grid(handle);
                None
            }
            Err(e) => {
                error!("Failed to start encoder: {}", e);
                Some(SessionEvent::EncoderSpawnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn start_rotation(&mut self, format: OutputFormat) -> Option<SessionEvent> {
        self.stop_encoder().await;

        let params = self.params.as_ref()?;
        let plan = RotationPlan::new(
            &params.sources,
            self.ctx.degraded.group_size,
            self.ctx.degraded.dwell,
        );
        info!(
            groups = plan.group_count(),
            dwell = ?plan.dwell(),
            "Starting degraded rotation"
        );
        self.launch_group(plan, format).await
    }

    /// Starts the plan's next group and arms the switch deadline.
    async fn launch_group(
        &mut self,
        mut plan: RotationPlan,
        format: OutputFormat,
    ) -> Option<SessionEvent> {
        let result = match plan.next_group() {
            Some(group) => self.ctx.supervisor.start_group(group, format),
            None => {
                return Some(SessionEvent::EncoderSpawnFailed {
                    reason: "rotation has no source groups".to_string(),
                });
            }
        };

        match result {
            Ok(handle) => {
                debug!(sources = ?handle.sources(), "Rotation group started");
                self.on_encoder_started(&handle, SessionMode::Degraded).await;
                let switch_at = Instant::now() + plan.dwell();
                self.encoder = EncoderSlot::Rotating {
                    plan,
                    handle,
                    format,
                    switch_at,
                };
                None
            }
            Err(e) => {
                error!("Failed to start rotation group: {}", e);
                Some(SessionEvent::EncoderSpawnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn rotate(&mut self) {
        let EncoderSlot::Rotating {
            plan,
            handle,
            format,
            ..
        } = std::mem::replace(&mut self.encoder, EncoderSlot::Idle)
        else {
            return;
        };

        handle.stop().await;
        if let Some(event) = self.launch_group(plan, format).await {
            self.process(event).await;
        }
    }

    async fn on_encoder_started(&mut self, handle: &EncoderHandle, mode: SessionMode) {
        self.encoders_started += 1;
        self.mux.begin_stream(handle.format());
        info!(
            encoder_id = handle.id(),
            pid = handle.pid(),
            ?mode,
            "Encoder attached to session"
        );
        if self.registered {
            if let Err(e) = self
                .ctx
                .registry
                .update_encoder(self.id, handle.pid(), mode)
                .await
            {
                debug!("Could not record encoder in registry: {}", e);
            }
        }
    }

    async fn stop_encoder(&mut self) {
        if let Some(handle) = self.encoder.take_handle() {
            let id = handle.id();
            let exit = handle.stop().await;
            debug!(encoder_id = id, ?exit, "Encoder released by session");
        }
    }

    /// Releases the encoder, the sink and the registry entry. Runs once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.stop_encoder().await;
        self.mux.release();

        if self.registered {
            self.registered = false;
            if let Err(e) = self.ctx.registry.deregister(self.id).await {
                debug!("Could not deregister session: {}", e);
            }
        }
        debug!("Session teardown complete");
    }
}

/// A shutdown trigger nobody holds; it resolves as dropped on first poll.
fn detached_trigger() -> oneshot::Receiver<()> {
    let (_, receiver) = oneshot::channel();
    receiver
}
