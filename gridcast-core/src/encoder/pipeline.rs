//! Composite pipeline description: which sources feed the grid, where each
//! tile lands, and the encoder command line that realises it.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::EncoderConfig;
use crate::streaming::OutputFormat;

/// Longest accepted source identifier.
const MAX_SOURCE_ID_LEN: usize = 256;

/// Identifier of one camera source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Validates a raw identifier. Returns `None` for empty, oversized or
    /// whitespace-containing input.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.len() > MAX_SOURCE_ID_LEN
            || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves the source URL, using the id verbatim if it already is an RTSP URL.
    pub fn url(&self, template: &str) -> String {
        if self.0.starts_with("rtsp://") || self.0.starts_with("rtsps://") {
            self.0.clone()
        } else {
            template.replace("{id}", &self.0)
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed row-major tile arrangement of the composite frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub columns: usize,
    pub rows: usize,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl GridLayout {
    /// Lays out `tiles` tiles using at most `max_columns` columns.
    pub fn for_tiles(tiles: usize, max_columns: usize, tile_width: u32, tile_height: u32) -> Self {
        let columns = max_columns.min(tiles).max(1);
        let rows = tiles.div_ceil(columns).max(1);
        Self {
            columns,
            rows,
            tile_width,
            tile_height,
        }
    }

    /// Pixel offset of the tile at `index`; index 0 is top-left.
    pub fn tile_origin(&self, index: usize) -> (u32, u32) {
        let column = (index % self.columns) as u32;
        let row = (index / self.columns) as u32;
        (column * self.tile_width, row * self.tile_height)
    }

    /// Width and height of the composite frame.
    pub fn canvas_size(&self) -> (u32, u32) {
        (
            self.columns as u32 * self.tile_width,
            self.rows as u32 * self.tile_height,
        )
    }

    /// `xstack` layout string with explicit pixel offsets for `tiles` inputs.
    pub fn xstack_layout(&self, tiles: usize) -> String {
        (0..tiles)
            .map(|index| {
                let (x, y) = self.tile_origin(index);
                format!("{x}_{y}")
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Everything needed to launch one encoder process.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    sources: Vec<SourceId>,
    urls: Vec<String>,
    layout: GridLayout,
    format: OutputFormat,
    frame_rate: u32,
    video_bitrate: String,
    keyframe_interval: u32,
    source_timeout_micros: u128,
}

impl PipelineSpec {
    /// Builds the pipeline for `sources` in the given order.
    pub fn new(sources: &[SourceId], format: OutputFormat, config: &EncoderConfig) -> Self {
        let layout = GridLayout::for_tiles(
            sources.len(),
            config.grid_columns,
            config.tile_width,
            config.tile_height,
        );
        let urls = sources
            .iter()
            .map(|source| source.url(&config.source_url_template))
            .collect();

        Self {
            sources: sources.to_vec(),
            urls,
            layout,
            format,
            frame_rate: config.frame_rate,
            video_bitrate: config.video_bitrate.clone(),
            keyframe_interval: config.keyframe_interval,
            source_timeout_micros: config.source_timeout.as_micros().max(1),
        }
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Filter graph scaling every input to one tile and stacking them into `[grid]`.
    pub fn filter_graph(&self) -> String {
        let tiles = self.sources.len();
        let mut graph = String::new();

        for index in 0..tiles {
            let _ = write!(
                graph,
                "[{index}:v]scale={w}:{h},setsar=1,fps={fps}[v{index}];",
                w = self.layout.tile_width,
                h = self.layout.tile_height,
                fps = self.frame_rate,
            );
        }

        if tiles == 1 {
            graph.push_str("[v0]null[grid]");
        } else {
            for index in 0..tiles {
                let _ = write!(graph, "[v{index}]");
            }
            let _ = write!(
                graph,
                "xstack=inputs={tiles}:layout={layout}:fill=black[grid]",
                layout = self.layout.xstack_layout(tiles),
            );
        }

        graph
    }

    /// Full encoder argument vector, writing the encoded stream to stdout.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // RTSP demuxer options only; a stalled camera times out as an upstream error.
        for url in &self.urls {
            args.extend([
                "-rtsp_transport".to_string(),
                "tcp".to_string(),
                "-timeout".to_string(),
                self.source_timeout_micros.to_string(),
                "-fflags".to_string(),
                "nobuffer".to_string(),
                "-flags".to_string(),
                "low_delay".to_string(),
                "-i".to_string(),
                url.clone(),
            ]);
        }

        args.extend([
            "-filter_complex".to_string(),
            self.filter_graph(),
            "-map".to_string(),
            "[grid]".to_string(),
            "-an".to_string(),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-g".to_string(),
            self.keyframe_interval.to_string(),
            "-b:v".to_string(),
            self.video_bitrate.clone(),
        ]);

        match self.format {
            OutputFormat::Mp4 => args.extend(
                [
                    "-c:v",
                    "libx264",
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "zerolatency",
                    "-profile:v",
                    "baseline",
                    "-pix_fmt",
                    "yuv420p",
                    "-f",
                    "mp4",
                    "-movflags",
                    "frag_keyframe+empty_moov+default_base_moof",
                ]
                .iter()
                .map(|s| s.to_string()),
            ),
            OutputFormat::Webm => args.extend(
                [
                    "-c:v",
                    "libvpx",
                    "-deadline",
                    "realtime",
                    "-cpu-used",
                    "8",
                    "-f",
                    "webm",
                    "-cluster_time_limit",
                    "1000",
                ]
                .iter()
                .map(|s| s.to_string()),
            ),
        }

        args.extend([
            "-flush_packets".to_string(),
            "1".to_string(),
            "pipe:1".to_string(),
        ]);

        args
    }
}
