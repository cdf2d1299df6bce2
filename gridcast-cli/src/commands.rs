//! CLI command implementations

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use gridcast_core::client::ReconnectAdvice;
use gridcast_core::config::GridcastConfig;
use gridcast_core::encoder::{PipelineSpec, SourceId};
use gridcast_core::streaming::OutputFormat;
use gridcast_web::run_server;
use url::Url;

use crate::watch::{WatchOptions, WatchReport, watch};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Number of cameras every connection must name
        #[arg(long)]
        sources: Option<usize>,
        /// Camera URL template, `{id}` is replaced by the source id
        #[arg(long)]
        source_template: Option<String>,
        /// Path to the ffmpeg executable
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
    },
    /// Print the encoder command line for a set of sources
    Plan {
        /// Comma-separated source ids
        source_ids: String,
        /// Output container
        #[arg(short, long, default_value = "mp4")]
        format: OutputFormat,
        /// Camera URL template, `{id}` is replaced by the source id
        #[arg(long)]
        source_template: Option<String>,
    },
    /// Watch a stream headlessly and write the media to a file
    Watch {
        /// Comma-separated source ids
        source_ids: String,
        /// File receiving the media fragments
        #[arg(short, long, default_value = "gridcast-watch.mp4")]
        output: PathBuf,
        /// Server base URL
        #[arg(long, default_value = "ws://127.0.0.1:3000")]
        server: Url,
        /// Output container
        #[arg(short, long, default_value = "mp4")]
        format: OutputFormat,
        /// Ask the server for the rotating low-resource mode
        #[arg(long)]
        degraded: bool,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Assumed media byte rate for the synthetic playback clock
        #[arg(long, default_value = "250000")]
        byte_rate: u64,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = GridcastConfig::from_env();

    match command {
        Commands::Serve {
            host,
            port,
            sources,
            source_template,
            ffmpeg,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(sources) = sources {
                config.encoder.source_count = sources;
            }
            if let Some(template) = source_template {
                config.encoder.source_url_template = template;
            }
            if let Some(program) = ffmpeg {
                config.encoder.program = program;
            }
            run_server(config).await.context("server failed")
        }
        Commands::Plan {
            source_ids,
            format,
            source_template,
        } => {
            if let Some(template) = source_template {
                config.encoder.source_url_template = template;
            }
            println!("{}", plan_command_line(&config, &source_ids, format)?);
            Ok(())
        }
        Commands::Watch {
            source_ids,
            output,
            server,
            format,
            degraded,
            seconds,
            byte_rate,
        } => {
            let options = WatchOptions {
                server,
                stream_path: config.server.stream_path.to_string(),
                source_ids,
                format,
                degraded,
                output: output.clone(),
                byte_rate,
                duration: seconds.map(Duration::from_secs),
                ingest: config.ingest.clone(),
            };
            let report = watch(options).await?;
            print_report(&report, &output);
            if report.advice == ReconnectAdvice::NotNeeded {
                Ok(())
            } else {
                bail!("stream ended abnormally ({:?})", report.advice)
            }
        }
    }
}

/// Renders the encoder invocation for `source_ids` as a shell-style line.
///
/// # Errors
///
/// - `anyhow::Error` - No ids were given or one of them is invalid
pub fn plan_command_line(
    config: &GridcastConfig,
    source_ids: &str,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let sources = source_ids
        .split(',')
        .map(|id| SourceId::new(id).with_context(|| format!("invalid source id '{id}'")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if sources.is_empty() {
        bail!("at least one source id is required");
    }

    let spec = PipelineSpec::new(&sources, format, &config.encoder);
    let mut line = vec![shell_quote(&config.encoder.program.to_string_lossy())];
    line.extend(spec.ffmpeg_args().iter().map(|arg| shell_quote(arg)));
    Ok(line.join(" "))
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn print_report(report: &WatchReport, output: &std::path::Path) {
    println!("Watch finished: {:?}", report.advice);
    println!("  Fragments received: {}", report.fragments_received);
    println!(
        "  Appended: {} ({:.2} MB) to {}",
        report.ingest.appended,
        report.ingest.bytes_appended as f64 / 1_048_576.0,
        output.display()
    );
    println!(
        "  Dropped: {} on overflow, {} after repeated errors",
        report.ingest.dropped_overflow, report.ingest.dropped_flush
    );
    if let Some(error) = &report.last_error {
        println!("  Last server error: {}", error.to_json());
    }
}
