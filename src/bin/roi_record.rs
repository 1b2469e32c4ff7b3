//! roi_record - region-of-interest recorder
//!
//! This binary:
//! 1. Loads the session configuration (config file, environment, then flags)
//! 2. Opens the frame source and one recorder per region
//! 3. Captures until the source ends, a limit is reached, or Ctrl-C
//! 4. Drains every region's buffer and prints a JSON session report
//!
//! Exit status is 1 when any region stopped with unflushed frames.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use roi_recorder::config::duration_from_secs;
use roi_recorder::{
    open_source, Dispatcher, ExitCode, OverflowPolicy, Region, SessionConfig, WriterFormat,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "roi_record",
    about = "Record regions of interest of a frame source into chunked storage"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output base path; region i records to <output>_ROI_<i>
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Frame source: stub://random|deterministic|gradient or a directory of PNGs
    #[arg(long, value_name = "URL")]
    source: Option<String>,

    /// Synthetic source width
    #[arg(long)]
    width: Option<u32>,

    /// Synthetic source height
    #[arg(long)]
    height: Option<u32>,

    /// Channels per pixel (1 or 3)
    #[arg(long)]
    channels: Option<u8>,

    /// Frame rate
    #[arg(long)]
    fps: Option<f64>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Stop once each region saved this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Frames buffered per region
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Full-buffer policy (drop-oldest|block)
    #[arg(long, value_name = "POLICY")]
    overflow: Option<OverflowPolicy>,

    /// Output writer (chunked-store|raw-images|ffmpeg)
    #[arg(long, value_name = "FORMAT")]
    writer: Option<WriterFormat>,

    /// Region of interest, repeatable (default: the whole frame)
    #[arg(long = "roi", value_name = "X,Y,W,H")]
    rois: Vec<Region>,

    /// Seconds of video per chunk
    #[arg(long, value_name = "SECS")]
    chunk_duration: Option<f64>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

impl Args {
    fn apply(&self, cfg: &mut SessionConfig) -> Result<()> {
        if let Some(output) = &self.output {
            cfg.output = output.clone();
        }
        if let Some(source) = &self.source {
            cfg.source.url = source.clone();
        }
        if let Some(width) = self.width {
            cfg.source.width = width;
        }
        if let Some(height) = self.height {
            cfg.source.height = height;
        }
        if let Some(channels) = self.channels {
            cfg.source.channels = channels;
        }
        if let Some(fps) = self.fps {
            cfg.source.fps = fps;
        }
        if let Some(duration) = self.duration {
            cfg.recording.duration = Some(duration_from_secs(duration)?);
        }
        if let Some(max_frames) = self.max_frames {
            cfg.recording.max_frames = Some(max_frames);
        }
        if let Some(size) = self.buffer_size {
            cfg.recording.buffer_size = size;
        }
        if let Some(policy) = self.overflow {
            cfg.recording.overflow = policy;
        }
        if let Some(format) = self.writer {
            cfg.writer.format = format;
        }
        if !self.rois.is_empty() {
            cfg.regions = self.rois.clone();
        }
        if let Some(chunk) = self.chunk_duration {
            cfg.recording.chunk_duration_s = chunk;
        }
        cfg.validate()
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = SessionConfig::load(args.config.as_deref())?;
        args.apply(&mut cfg)?;
        cfg
    };

    let source = {
        let _stage = ui.stage("Open source");
        open_source(&cfg.source_config())
            .with_context(|| format!("failed to open source {}", cfg.source.url))?
    };
    let dispatcher_cfg = cfg.dispatcher_config(source.resolution());
    let capacities = vec![cfg.recording.buffer_size; dispatcher_cfg.regions.len()];

    let mut dispatcher = Dispatcher::new(source, cfg.backend(), dispatcher_cfg);
    {
        let _stage = ui.stage("Open recorders");
        dispatcher.open(&cfg.output)?;
    }

    let stop = dispatcher.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, draining buffers...");
        stop.stop();
    })
    .expect("error setting Ctrl-C handler");

    if let Some(bars) = ui.buffer_bars(&capacities) {
        dispatcher = dispatcher.with_progress(Box::new(bars));
    }

    let report = {
        let _stage = ui.stage("Record");
        dispatcher.run()?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.exit_code() == ExitCode::Unflushed {
        log::warn!("one or more regions stopped with unflushed frames");
        std::process::exit(report.exit_code().code());
    }
    Ok(())
}
