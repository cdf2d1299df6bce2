//! Encoder process supervision.
//!
//! The supervisor spawns one external encoder per request and hands back an
//! [`EncoderHandle`] that exclusively owns the process. Output chunks,
//! classified diagnostics and the final exit are delivered as
//! [`EncoderEvent`]s on the handle.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::diagnostics::{DiagnosticClass, classify};
use super::pipeline::{PipelineSpec, SourceId};
use crate::config::EncoderConfig;
use crate::streaming::OutputFormat;

/// Errors raised when an encoder cannot be started.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Caller error: a full grid needs exactly the configured number of sources
    #[error("Expected {expected} sources, got {actual}")]
    WrongSourceCount { expected: usize, actual: usize },

    #[error("A rotation group needs at least one source")]
    EmptyGroup,

    #[error("Failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Encoder process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Builds the OS command for a pipeline.
///
/// This is the seam to the external encoder; stdio wiring is done by the
/// supervisor.
pub trait EncoderBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Creates the command that runs `spec`.
    fn command(&self, spec: &PipelineSpec) -> Command;
}

/// Production backend running the ffmpeg binary.
pub struct FfmpegBackend {
    program: PathBuf,
}

impl FfmpegBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn command(&self, spec: &PipelineSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(spec.ffmpeg_args());
        cmd
    }
}

/// Why a fatal diagnostic stops the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    OutOfMemory,
    Upstream,
}

/// A diagnostic line that ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalDiagnostic {
    pub kind: FatalKind,
    pub line: String,
    /// Source whose URL appears in the line, when one does
    pub source: Option<SourceId>,
}

/// How an encoder process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Output of a running encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// Encoded bytes from stdout, in order
    Chunk(Bytes),
    /// Non-fatal diagnostic worth surfacing
    Diagnostic { line: String },
    /// Fatal diagnostic; the caller must tear down and not retry
    Fatal(FatalDiagnostic),
    /// The process is gone; always the last event
    Exited(ExitInfo),
}

/// Process counters shared between the supervisor and its encoder tasks.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    started: AtomicU64,
    kill_signals: AtomicU64,
    exited: AtomicU64,
}

/// Point-in-time copy of [`SupervisorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub started: u64,
    /// Termination signals sent on request
    pub kill_signals: u64,
    pub exited: u64,
}

impl SupervisorSnapshot {
    /// Processes spawned and not yet reaped.
    pub fn alive(&self) -> u64 {
        self.started.saturating_sub(self.exited)
    }
}

impl SupervisorStats {
    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            started: self.started.load(Ordering::SeqCst),
            kill_signals: self.kill_signals.load(Ordering::SeqCst),
            exited: self.exited.load(Ordering::SeqCst),
        }
    }
}

/// Spawns and tracks encoder processes.
pub struct EncoderSupervisor {
    backend: Arc<dyn EncoderBackend>,
    config: EncoderConfig,
    next_id: AtomicU64,
    stats: Arc<SupervisorStats>,
}

impl EncoderSupervisor {
    pub fn new(backend: Arc<dyn EncoderBackend>, config: EncoderConfig) -> Self {
        Self {
            backend,
            config,
            next_id: AtomicU64::new(1),
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    /// Starts a full-grid encoder.
    ///
    /// # Errors
    ///
    /// - `EncoderError::WrongSourceCount` - `sources` does not have the configured cardinality
    /// - `EncoderError::Spawn` - The encoder binary could not be started
    /// - `EncoderError::MissingPipe` - The spawned process lacks a piped stream
    pub fn start(
        &self,
        sources: &[SourceId],
        format: OutputFormat,
    ) -> Result<EncoderHandle, EncoderError> {
        if sources.len() != self.config.source_count {
            return Err(EncoderError::WrongSourceCount {
                expected: self.config.source_count,
                actual: sources.len(),
            });
        }
        self.launch(PipelineSpec::new(sources, format, &self.config))
    }

    /// Starts an encoder for one degraded-mode subgroup.
    ///
    /// # Errors
    ///
    /// - `EncoderError::EmptyGroup` - `group` is empty
    /// - `EncoderError::Spawn` - The encoder binary could not be started
    /// - `EncoderError::MissingPipe` - The spawned process lacks a piped stream
    pub fn start_group(
        &self,
        group: &[SourceId],
        format: OutputFormat,
    ) -> Result<EncoderHandle, EncoderError> {
        if group.is_empty() {
            return Err(EncoderError::EmptyGroup);
        }
        self.launch(PipelineSpec::new(group, format, &self.config))
    }

    pub fn stats(&self) -> SupervisorSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn launch(&self, spec: PipelineSpec) -> Result<EncoderHandle, EncoderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut cmd = self.backend.command(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(encoder_id = id, backend = self.backend.name(), ?cmd, "Spawning encoder");

        let mut child = cmd.spawn().map_err(|source| EncoderError::Spawn {
            program: self.backend.name().to_string(),
            source,
        })?;
        self.stats.started.fetch_add(1, Ordering::SeqCst);

        let pid = child.id();
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (stdout, _) => {
                // Reaped by kill_on_drop; counted so alive() stays accurate.
                self.stats.exited.fetch_add(1, Ordering::SeqCst);
                let missing = if stdout.is_none() { "stdout" } else { "stderr" };
                return Err(EncoderError::MissingPipe(missing));
            }
        };

        info!(
            encoder_id = id,
            pid,
            sources = spec.sources().len(),
            format = %spec.format(),
            "Encoder started"
        );

        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = EncoderTask {
            id,
            child,
            stdout,
            stderr,
            events: events_tx,
            shutdown: shutdown_rx,
            chunk_size: self.config.read_chunk_size.max(1),
            sources: spec.sources().iter().cloned().zip(spec.urls().iter().cloned()).collect(),
            stats: Arc::clone(&self.stats),
        };

        Ok(EncoderHandle {
            id,
            pid,
            sources: spec.sources().to_vec(),
            format: spec.format(),
            events: events_rx,
            shutdown: shutdown_tx,
            task: tokio::spawn(task.run()),
        })
    }
}

/// Exclusive owner of one running encoder process.
///
/// Dropping the handle terminates the process; [`stop`](Self::stop) does the
/// same and waits for the exit.
pub struct EncoderHandle {
    id: u64,
    pid: Option<u32>,
    sources: Vec<SourceId>,
    format: OutputFormat,
    events: mpsc::Receiver<EncoderEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<ExitInfo>,
}

impl EncoderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Next event from the encoder. Returns `None` after `Exited` was delivered.
    pub async fn next_event(&mut self) -> Option<EncoderEvent> {
        self.events.recv().await
    }

    /// Terminates the process if it is still running and waits for it to be reaped.
    ///
    /// Consumes the handle, so a process is signalled at most once.
    pub async fn stop(self) -> Option<ExitInfo> {
        let Self {
            id,
            events,
            shutdown,
            task,
            ..
        } = self;

        // Unblocks a task waiting on a full event channel.
        drop(events);
        let _ = shutdown.send(());

        match task.await {
            Ok(exit) => {
                debug!(encoder_id = id, %exit, "Encoder stopped");
                Some(exit)
            }
            Err(e) => {
                error!(encoder_id = id, "Encoder task failed: {}", e);
                None
            }
        }
    }
}

/// Result of one wait inside the encoder loop.
enum Step {
    Shutdown,
    Stdout(io::Result<usize>),
    Stderr(io::Result<Option<String>>),
    Exited(io::Result<ExitStatus>),
}

struct EncoderTask {
    id: u64,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    events: mpsc::Sender<EncoderEvent>,
    shutdown: oneshot::Receiver<()>,
    chunk_size: usize,
    sources: Vec<(SourceId, String)>,
    stats: Arc<SupervisorStats>,
}

impl EncoderTask {
    async fn run(self) -> ExitInfo {
        let Self {
            id,
            mut child,
            mut stdout,
            stderr,
            events,
            mut shutdown,
            chunk_size,
            sources,
            stats,
        } = self;

        let mut lines = BufReader::new(stderr).lines();
        let mut buffer = vec![0u8; chunk_size];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut bytes_out = 0u64;

        let exit = loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Shutdown,
                read = stdout.read(&mut buffer), if stdout_open => Step::Stdout(read),
                line = lines.next_line(), if stderr_open => Step::Stderr(line),
                status = child.wait() => Step::Exited(status),
            };

            let event = match step {
                Step::Shutdown => break terminate(id, &mut child, &stats).await,
                Step::Stdout(Ok(0)) => {
                    debug!(encoder_id = id, bytes_out, "Encoder stdout closed");
                    stdout_open = false;
                    continue;
                }
                Step::Stdout(Ok(n)) => {
                    bytes_out += n as u64;
                    EncoderEvent::Chunk(Bytes::copy_from_slice(&buffer[..n]))
                }
                Step::Stdout(Err(e)) => {
                    warn!(encoder_id = id, "Error reading encoder stdout: {}", e);
                    stdout_open = false;
                    continue;
                }
                Step::Stderr(Ok(Some(line))) => match diagnostic_event(id, line, &sources) {
                    Some(event) => event,
                    None => continue,
                },
                Step::Stderr(Ok(None)) => {
                    stderr_open = false;
                    continue;
                }
                Step::Stderr(Err(e)) => {
                    warn!(encoder_id = id, "Error reading encoder stderr: {}", e);
                    stderr_open = false;
                    continue;
                }
                Step::Exited(status) => {
                    let exit = match status {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            error!(encoder_id = id, "Failed to wait for encoder: {}", e);
                            ExitInfo::default()
                        }
                    };
                    let mut tail = Tail {
                        id,
                        events: &events,
                        sources: &sources,
                    };
                    if stdout_open {
                        bytes_out += tail.drain_stdout(&mut stdout, &mut buffer).await;
                    }
                    if stderr_open {
                        tail.drain_stderr(&mut lines).await;
                    }
                    info!(encoder_id = id, %exit, bytes_out, "Encoder exited");
                    break exit;
                }
            };

            if events.send(event).await.is_err() {
                // Handle dropped without stop(); still reap the process.
                break terminate(id, &mut child, &stats).await;
            }
        };

        stats.exited.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(EncoderEvent::Exited(exit)).await;
        exit
    }
}

/// How long output left in the pipes is still collected after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Collects output the process wrote just before exiting.
struct Tail<'a> {
    id: u64,
    events: &'a mpsc::Sender<EncoderEvent>,
    sources: &'a [(SourceId, String)],
}

impl Tail<'_> {
    async fn drain_stdout(&mut self, stdout: &mut ChildStdout, buffer: &mut [u8]) -> u64 {
        let mut drained = 0u64;
        let drain = async {
            while let Ok(n) = stdout.read(buffer).await {
                if n == 0 {
                    break;
                }
                drained += n as u64;
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if self.events.send(EncoderEvent::Chunk(chunk)).await.is_err() {
                    break;
                }
            }
        };
        if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(encoder_id = self.id, "Encoder stdout still open after exit");
        }
        drained
    }

    async fn drain_stderr(&mut self, lines: &mut Lines<BufReader<ChildStderr>>) {
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = diagnostic_event(self.id, line, self.sources) {
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        };
        let _ = timeout(DRAIN_TIMEOUT, drain).await;
    }
}

async fn terminate(id: u64, child: &mut Child, stats: &SupervisorStats) -> ExitInfo {
    if let Ok(Some(status)) = child.try_wait() {
        return ExitInfo::from_status(status);
    }

    match child.start_kill() {
        Ok(()) => {
            stats.kill_signals.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) => warn!(encoder_id = id, "Failed to signal encoder: {}", e),
    }

    match child.wait().await {
        Ok(status) => {
            let exit = ExitInfo::from_status(status);
            info!(encoder_id = id, %exit, "Encoder terminated");
            exit
        }
        Err(e) => {
            error!(encoder_id = id, "Failed to reap encoder: {}", e);
            ExitInfo::default()
        }
    }
}

fn diagnostic_event(id: u64, line: String, sources: &[(SourceId, String)]) -> Option<EncoderEvent> {
    let class = classify(&line);
    let kind = match class {
        DiagnosticClass::Noise => return None,
        DiagnosticClass::Generic => {
            debug!(encoder_id = id, %line, "Encoder diagnostic");
            return Some(EncoderEvent::Diagnostic { line });
        }
        DiagnosticClass::OutOfMemory => FatalKind::OutOfMemory,
        DiagnosticClass::Upstream => FatalKind::Upstream,
    };

    let source = attribute_source(&line, sources);

    warn!(encoder_id = id, ?kind, ?source, %line, "Fatal encoder diagnostic");
    Some(EncoderEvent::Fatal(FatalDiagnostic { kind, line, source }))
}

/// Names the source a fatal line is about.
///
/// Full URLs win over bare ids, and the longest match wins within each kind.
/// Ids only count as whole tokens, so `1` does not match inside `127.0.0.1`
/// and `cam1` does not match inside `cam10`.
fn attribute_source(line: &str, sources: &[(SourceId, String)]) -> Option<SourceId> {
    let by_url = sources
        .iter()
        .filter(|(_, url)| contains_token(line, url))
        .max_by_key(|(_, url)| url.len());
    let by_id = || {
        sources
            .iter()
            .filter(|(source, _)| contains_token(line, source.as_str()))
            .max_by_key(|(source, _)| source.as_str().len())
    };
    by_url.or_else(by_id).map(|(source, _)| source.clone())
}

fn contains_token(line: &str, needle: &str) -> bool {
    !needle.is_empty()
        && line.match_indices(needle).any(|(start, _)| {
            let before = line[..start].chars().next_back();
            let mut after = line[start + needle.len()..].chars();
            let bounded_before = before.is_none_or(|c| !is_token_char(c));
            let bounded_after = match after.next() {
                None => true,
                // A trailing full stop ends a sentence, not a hostname.
                Some('.') => after.next().is_none_or(|c| !c.is_alphanumeric()),
                Some(c) => !is_token_char(c),
            };
            bounded_before && bounded_after
        })
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}
