//! Frame ingestion sources.
//!
//! This module provides the sources a recording session can capture from:
//! - Synthetic emulator cameras (`stub://random`, `stub://deterministic`, `stub://gradient`)
//! - Local directories of PNG images, replayed in lexical order
//!
//! All sources yield `(timestamp, Image)` pairs, where the timestamp is seconds since
//! capture start (or since the Unix epoch when wall-clock timestamps are requested).
//! A source returns `Ok(None)` once exhausted; errors are capture failures and are
//! retried by the dispatcher.
//!
//! Camera drivers live outside this crate; they plug in by implementing `FrameSource`.

pub mod file;
pub mod synthetic;

use anyhow::{anyhow, Result};

use crate::frame::Image;
use crate::logctx::LogContext;

pub use file::ImageDirSource;
pub use synthetic::SyntheticSource;

/// A stream of captured frames.
pub trait FrameSource: Send {
    /// (width, height) of every frame this source yields.
    fn resolution(&self) -> (u32, u32);

    /// Channels per pixel (1 = gray, 3 = RGB).
    fn channels(&self) -> u8;

    /// Capture the next frame. `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<(f64, Image)>>;

    /// Release the underlying device. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://<pattern>` or a local directory path.
    pub url: String,
    /// Frame width (synthetic sources only; directories use the first image).
    pub width: u32,
    /// Frame height (synthetic sources only).
    pub height: u32,
    /// Channels to deliver (1 or 3).
    pub channels: u8,
    /// Target frame rate (frames per second).
    pub target_fps: f64,
    /// Sleep between frames to hold `target_fps`.
    pub paced: bool,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// Timestamps in seconds since the Unix epoch instead of since start.
    pub use_wall_clock: bool,
    pub log: LogContext,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://random".to_string(),
            width: 640,
            height: 480,
            channels: 1,
            target_fps: 30.0,
            paced: true,
            max_frames: None,
            use_wall_clock: false,
            log: LogContext::session(),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Open the source named by `config.url`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())?));
    }
    if !is_local_path(&config.url) {
        return Err(anyhow!(
            "source '{}' is not supported: only stub:// and local directories",
            config.url
        ));
    }
    Ok(Box::new(ImageDirSource::new(config.clone())?))
}

fn is_local_path(url: &str) -> bool {
    !url.trim().is_empty() && !url.contains("://")
}
