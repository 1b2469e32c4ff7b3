use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::{CapturePolicy, DispatcherConfig};
use crate::ingest::SourceConfig;
use crate::logctx::LogContext;
use crate::recorder::{OverflowPolicy, RecorderConfig};
use crate::region::{validate_regions, Region};
use crate::storage::{FfmpegOptions, StorageBackend, WriterFormat};

const DEFAULT_OUTPUT: &str = "recording";
const DEFAULT_SOURCE_URL: &str = "stub://random";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CHANNELS: u8 = 1;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_BUFFER_SIZE: usize = 500;
const DEFAULT_CHUNK_DURATION_SECS: f64 = 300.0;
const DEFAULT_INFO_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_EXTRA_DATA_INTERVAL_SECS: u64 = 60;
const DEFAULT_CAPTURE_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    output: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    regions: Option<Vec<Region>>,
    recording: Option<RecordingConfigFile>,
    writer: Option<WriterConfigFile>,
    capture: Option<CaptureConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u8>,
    fps: Option<f64>,
    paced: Option<bool>,
    wall_clock: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    duration_secs: Option<f64>,
    max_frames: Option<u64>,
    buffer_size: Option<usize>,
    overflow: Option<OverflowPolicy>,
    chunk_duration_secs: Option<f64>,
    info_interval_secs: Option<f64>,
    extra_data_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WriterConfigFile {
    format: Option<WriterFormat>,
    ffmpeg: Option<FfmpegOptions>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base output path; region `i` records to `<output>_ROI_<i>`.
    pub output: PathBuf,
    pub source: SourceSettings,
    /// Empty means the whole frame.
    pub regions: Vec<Region>,
    pub recording: RecordingSettings,
    pub writer: WriterSettings,
    pub capture: CapturePolicy,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub fps: f64,
    pub paced: bool,
    pub wall_clock: bool,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub duration: Option<Duration>,
    pub max_frames: Option<u64>,
    pub buffer_size: usize,
    pub overflow: OverflowPolicy,
    pub chunk_duration_s: f64,
    pub info_interval_s: f64,
    pub extra_data_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub format: WriterFormat,
    pub ffmpeg: FfmpegOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            source: SourceSettings {
                url: DEFAULT_SOURCE_URL.to_string(),
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                channels: DEFAULT_CHANNELS,
                fps: DEFAULT_FPS,
                paced: true,
                wall_clock: false,
            },
            regions: Vec::new(),
            recording: RecordingSettings {
                duration: None,
                max_frames: None,
                buffer_size: DEFAULT_BUFFER_SIZE,
                overflow: OverflowPolicy::default(),
                chunk_duration_s: DEFAULT_CHUNK_DURATION_SECS,
                info_interval_s: DEFAULT_INFO_INTERVAL_SECS,
                extra_data_interval: Duration::from_secs(DEFAULT_EXTRA_DATA_INTERVAL_SECS),
            },
            writer: WriterSettings {
                format: WriterFormat::default(),
                ffmpeg: FfmpegOptions::default(),
            },
            capture: CapturePolicy {
                max_attempts: DEFAULT_CAPTURE_RETRIES,
                retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            },
        }
    }
}

impl SessionConfig {
    /// Load `path` (or `ROIREC_CONFIG` when `path` is `None`), then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("ROIREC_CONFIG").ok().map(PathBuf::from);
        let config_path = path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SessionConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(output) = file.output {
            cfg.output = output;
        }
        if let Some(source) = file.source {
            let s = &mut cfg.source;
            s.url = source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
            s.width = source.width.unwrap_or(DEFAULT_WIDTH);
            s.height = source.height.unwrap_or(DEFAULT_HEIGHT);
            s.channels = source.channels.unwrap_or(DEFAULT_CHANNELS);
            s.fps = source.fps.unwrap_or(DEFAULT_FPS);
            s.paced = source.paced.unwrap_or(true);
            s.wall_clock = source.wall_clock.unwrap_or(false);
        }
        cfg.regions = file.regions.unwrap_or_default();
        if let Some(recording) = file.recording {
            let r = &mut cfg.recording;
            r.duration = recording.duration_secs.map(duration_from_secs).transpose()?;
            r.max_frames = recording.max_frames;
            r.buffer_size = recording.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
            r.overflow = recording.overflow.unwrap_or_default();
            r.chunk_duration_s = recording
                .chunk_duration_secs
                .unwrap_or(DEFAULT_CHUNK_DURATION_SECS);
            r.info_interval_s = recording
                .info_interval_secs
                .unwrap_or(DEFAULT_INFO_INTERVAL_SECS);
            r.extra_data_interval = Duration::from_secs(
                recording
                    .extra_data_interval_secs
                    .unwrap_or(DEFAULT_EXTRA_DATA_INTERVAL_SECS),
            );
        }
        if let Some(writer) = file.writer {
            cfg.writer.format = writer.format.unwrap_or_default();
            cfg.writer.ffmpeg = writer.ffmpeg.unwrap_or_default();
        }
        if let Some(capture) = file.capture {
            cfg.capture.max_attempts = capture.retries.unwrap_or(DEFAULT_CAPTURE_RETRIES);
            cfg.capture.retry_delay =
                Duration::from_millis(capture.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS));
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(output) = std::env::var("ROIREC_OUTPUT") {
            if !output.trim().is_empty() {
                self.output = PathBuf::from(output);
            }
        }
        if let Ok(url) = std::env::var("ROIREC_SOURCE") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(fps) = std::env::var("ROIREC_FPS") {
            self.source.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROIREC_FPS must be a number of frames per second"))?;
        }
        if let Ok(duration) = std::env::var("ROIREC_DURATION_SECS") {
            let seconds: f64 = duration
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROIREC_DURATION_SECS must be a number of seconds"))?;
            self.recording.duration = Some(duration_from_secs(seconds)?);
        }
        if let Ok(max_frames) = std::env::var("ROIREC_MAX_FRAMES") {
            self.recording.max_frames = Some(
                max_frames
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("ROIREC_MAX_FRAMES must be an integer"))?,
            );
        }
        if let Ok(size) = std::env::var("ROIREC_BUFFER_SIZE") {
            self.recording.buffer_size = size
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROIREC_BUFFER_SIZE must be an integer"))?;
        }
        if let Ok(policy) = std::env::var("ROIREC_OVERFLOW") {
            self.recording.overflow = policy
                .parse()
                .map_err(|e: String| anyhow!("ROIREC_OVERFLOW: {}", e))?;
        }
        if let Ok(format) = std::env::var("ROIREC_WRITER") {
            self.writer.format = format
                .parse()
                .map_err(|e: String| anyhow!("ROIREC_WRITER: {}", e))?;
        }
        if let Ok(rois) = std::env::var("ROIREC_ROIS") {
            let parsed = parse_regions(&rois)?;
            if !parsed.is_empty() {
                self.regions = parsed;
            }
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.source.fps.is_finite() && self.source.fps > 0.0) {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if self.source.channels != 1 && self.source.channels != 3 {
            return Err(anyhow!(
                "channels must be 1 (gray) or 3 (rgb), got {}",
                self.source.channels
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source resolution must be non-zero"));
        }
        if self.recording.buffer_size == 0 {
            return Err(anyhow!("buffer size must be greater than zero"));
        }
        if !(self.recording.chunk_duration_s.is_finite() && self.recording.chunk_duration_s > 0.0)
        {
            return Err(anyhow!("chunk duration must be greater than zero"));
        }
        if self.capture.max_attempts == 0 {
            return Err(anyhow!("capture retries must be at least 1"));
        }
        if !self.regions.is_empty() {
            validate_regions(&self.regions)?;
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.source.url.clone(),
            width: self.source.width,
            height: self.source.height,
            channels: self.source.channels,
            target_fps: self.source.fps,
            paced: self.source.paced,
            max_frames: None,
            use_wall_clock: self.source.wall_clock,
            log: LogContext::session(),
        }
    }

    /// Regions to record from a source of `resolution`; the full frame when none are set.
    pub fn resolved_regions(&self, resolution: (u32, u32)) -> Vec<Region> {
        if self.regions.is_empty() {
            vec![Region::full(resolution.0, resolution.1)]
        } else {
            self.regions.clone()
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            framerate: self.source.fps,
            buffer_size: self.recording.buffer_size,
            overflow: self.recording.overflow,
            duration: self.recording.duration,
            max_frames: self.recording.max_frames,
            chunk_duration_s: self.recording.chunk_duration_s,
            info_interval_s: self.recording.info_interval_s,
            extra_data_interval: self.recording.extra_data_interval,
            ..RecorderConfig::default()
        }
    }

    pub fn dispatcher_config(&self, resolution: (u32, u32)) -> DispatcherConfig {
        DispatcherConfig {
            regions: self.resolved_regions(resolution),
            recorder: self.recorder_config(),
            capture: self.capture.clone(),
            ..DispatcherConfig::default()
        }
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.writer.format.backend(&self.writer.ffmpeg)
    }
}

fn read_config_file(path: &Path) -> Result<SessionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

pub fn duration_from_secs(seconds: f64) -> Result<Duration> {
    if seconds <= 0.0 {
        return Err(anyhow!("duration must be a positive number of seconds"));
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| anyhow!("invalid duration {}: {}", seconds, e))
}

/// Parse `x,y,w,h;x,y,w,h`.
pub fn parse_regions(value: &str) -> Result<Vec<Region>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse::<Region>().map_err(|e| anyhow!(e)))
        .collect()
}
