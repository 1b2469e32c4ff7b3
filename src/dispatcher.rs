//! Capture loop and fan-out.
//!
//! The `Dispatcher` owns the frame source and one `Recorder` per region. `run()` pulls
//! frames, cuts them into regions and pushes each sub-image onto its recorder's bounded
//! buffer. The loop ends when the source is exhausted, the stop handle fires, or every
//! recorder has met its own stop condition. Shutdown then stops every recorder and waits
//! for each writer to drain.
//!
//! Capture failures are retried up to `CapturePolicy::max_attempts` times in a row. A
//! failure on the very first capture of a session is returned immediately.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::{Frame, Image, ImageShape};
use crate::ingest::FrameSource;
use crate::logctx::LogContext;
use crate::recorder::{ExitCode, Recorder, RecorderConfig, RecorderState};
use crate::region::{region_output_path, split_frame, validate_regions, Region};
use crate::sensor::Sensor;
use crate::storage::StorageBackend;

/// Receives progress while the capture loop runs.
pub trait ProgressSink: Send {
    fn buffer_usage(&self, region: usize, buffered: usize, capacity: usize);

    fn frames_captured(&self, _count: u64) {}

    fn finish(&self) {}
}

#[derive(Clone, Debug)]
pub struct CapturePolicy {
    /// Consecutive failed captures tolerated before the session is torn down.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub regions: Vec<Region>,
    pub recorder: RecorderConfig,
    pub capture: CapturePolicy,
    /// Interval between buffer usage reports.
    pub report_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            recorder: RecorderConfig::default(),
            capture: CapturePolicy::default(),
            report_interval: Duration::from_millis(500),
        }
    }
}

/// Cloneable external stop flag, e.g. for a Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RegionReport {
    pub index: usize,
    pub region: Region,
    pub path: PathBuf,
    pub saved: u64,
    pub lost: u64,
    pub write_errors: u64,
    pub chunks: u64,
    pub exit_code: ExitCode,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub frames_captured: u64,
    pub regions: Vec<RegionReport>,
}

impl SessionReport {
    /// `Unflushed` if any region did not shut down cleanly.
    pub fn exit_code(&self) -> ExitCode {
        if self
            .regions
            .iter()
            .all(|r| r.exit_code == ExitCode::Clean)
        {
            ExitCode::Clean
        } else {
            ExitCode::Unflushed
        }
    }

    pub fn total_lost(&self) -> u64 {
        self.regions.iter().map(|r| r.lost).sum()
    }
}

pub struct Dispatcher {
    source: Box<dyn FrameSource>,
    backend: Arc<dyn StorageBackend>,
    config: DispatcherConfig,
    sensor: Option<Arc<dyn Sensor>>,
    progress: Option<Box<dyn ProgressSink>>,
    recorders: Vec<Recorder>,
    stop: StopHandle,
    frames_captured: u64,
    log: LogContext,
    closed: bool,
}

impl Dispatcher {
    pub fn new(
        source: Box<dyn FrameSource>,
        backend: Arc<dyn StorageBackend>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            backend,
            config,
            sensor: None,
            progress: None,
            recorders: Vec::new(),
            stop: StopHandle::default(),
            frames_captured: 0,
            log: LogContext::session(),
            closed: false,
        }
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn Sensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn recorders(&self) -> &[Recorder] {
        &self.recorders
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    /// Create and open one recorder per region, writing to `<base>_ROI_<idx>`.
    pub fn open(&mut self, base: &Path) -> Result<(), PipelineError> {
        if !self.recorders.is_empty() || self.closed {
            return Err(PipelineError::Configuration(
                "dispatcher was already opened".to_string(),
            ));
        }
        let regions = self.config.regions.clone();
        validate_regions(&regions)?;
        let (width, height) = self.source.resolution();
        let channels = self.source.channels();
        for (index, region) in regions.iter().enumerate() {
            if !region.fits_within(width, height) {
                return Err(PipelineError::InvalidRegion {
                    index,
                    region: *region,
                    frame_width: width,
                    frame_height: height,
                });
            }
        }

        for (idx, region) in regions.iter().enumerate() {
            let mut recorder = Recorder::new(
                idx,
                region_output_path(base, idx),
                ImageShape::new(region.width, region.height, channels),
                self.backend.clone(),
                self.config.recorder.clone(),
                LogContext::for_region(idx),
            );
            if let Some(sensor) = &self.sensor {
                recorder = recorder.with_sensor(sensor.clone());
            }
            if let Err(err) = recorder.open() {
                for opened in self.recorders.iter_mut() {
                    opened.close();
                }
                self.recorders.clear();
                return Err(err);
            }
            self.recorders.push(recorder);
        }
        log::info!(
            target: self.log.target(),
            "dispatcher: {} region(s) from a {}x{}x{} source, output base {}",
            regions.len(),
            width,
            height,
            channels,
            base.display()
        );
        Ok(())
    }

    /// Capture until the source ends or a stop condition holds, then shut down.
    pub fn run(&mut self) -> Result<SessionReport, PipelineError> {
        if self.recorders.is_empty() {
            return Err(PipelineError::Configuration(
                "dispatcher must be opened before run".to_string(),
            ));
        }
        let outcome = self.start_all().and_then(|()| self.capture_loop());
        let report = self.shutdown();
        match outcome {
            Ok(()) => Ok(report),
            Err(err) => {
                log::error!(target: self.log.target(), "dispatcher: session aborted: {}", err);
                Err(err)
            }
        }
    }

    fn start_all(&mut self) -> Result<(), PipelineError> {
        for recorder in self.recorders.iter_mut() {
            recorder.start()?;
        }
        Ok(())
    }

    fn capture_loop(&mut self) -> Result<(), PipelineError> {
        let mut last_report = Instant::now();
        loop {
            if self.stop.is_stopped() {
                log::info!(target: self.log.target(), "dispatcher: stop requested");
                break;
            }
            if self.recorders.iter().all(|r| r.should_stop()) {
                log::info!(target: self.log.target(), "dispatcher: all regions reached their limit");
                break;
            }
            let Some((timestamp, image)) = self.capture()? else {
                log::info!(
                    target: self.log.target(),
                    "dispatcher: source exhausted after {} frame(s)",
                    self.frames_captured
                );
                break;
            };
            let sequence = self.frames_captured;
            self.frames_captured += 1;
            self.dispatch(timestamp, sequence, &image)?;

            if let Some(progress) = &self.progress {
                progress.frames_captured(self.frames_captured);
            }
            if last_report.elapsed() >= self.config.report_interval {
                self.report_buffers();
                last_report = Instant::now();
            }
        }
        Ok(())
    }

    fn capture(&mut self) -> Result<Option<(f64, Image)>, PipelineError> {
        let mut attempts = 0;
        loop {
            match self.source.next_frame() {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    attempts += 1;
                    if self.frames_captured == 0 || attempts >= self.config.capture.max_attempts {
                        return Err(PipelineError::Capture {
                            attempts,
                            message: format!("{:#}", err),
                        });
                    }
                    log::warn!(
                        target: self.log.target(),
                        "dispatcher: capture failed after frame {} (attempt {}/{}): {:#}",
                        self.frames_captured,
                        attempts,
                        self.config.capture.max_attempts,
                        err
                    );
                    std::thread::sleep(self.config.capture.retry_delay);
                }
            }
        }
    }

    fn dispatch(&self, timestamp: f64, sequence: u64, image: &Image) -> Result<(), PipelineError> {
        let crops = split_frame(image, &self.config.regions)?;
        for (recorder, crop) in self.recorders.iter().zip(crops) {
            if recorder.state() >= RecorderState::Stopping {
                continue;
            }
            if let Err(err) = recorder.write(Frame::new(timestamp, sequence, crop)) {
                log::debug!(
                    target: self.log.target(),
                    "dispatcher: frame {} (t={:.3}s) not queued: {}",
                    sequence,
                    timestamp,
                    err
                );
            }
        }
        Ok(())
    }

    fn report_buffers(&self) {
        for recorder in &self.recorders {
            let buffered = recorder.report_cache_usage();
            if let Some(progress) = &self.progress {
                progress.buffer_usage(recorder.index(), buffered, recorder.capacity());
            }
            log::debug!(
                target: self.log.target(),
                "dispatcher: roi {} buffer {} / {}",
                recorder.index(),
                buffered,
                recorder.capacity()
            );
        }
    }

    /// Stop every recorder, wait for all writers to drain, release the source.
    fn shutdown(&mut self) -> SessionReport {
        self.stop.stop();
        for recorder in &self.recorders {
            recorder.request_stop();
        }
        for recorder in self.recorders.iter_mut() {
            recorder.close();
        }
        if let Err(err) = self.source.close() {
            log::warn!(target: self.log.target(), "dispatcher: closing source failed: {:#}", err);
        }
        self.report_buffers();
        if let Some(progress) = &self.progress {
            progress.finish();
        }
        self.closed = true;
        let report = self.report();
        log::info!(
            target: self.log.target(),
            "dispatcher: {} frame(s) captured, {} lost, exit code {}",
            report.frames_captured,
            report.total_lost(),
            report.exit_code().code()
        );
        report
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            frames_captured: self.frames_captured,
            regions: self
                .recorders
                .iter()
                .map(|r| RegionReport {
                    index: r.index(),
                    region: self.config.regions[r.index()],
                    path: r.path().to_path_buf(),
                    saved: r.n_saved_frames(),
                    lost: r.lost_frames(),
                    write_errors: r.write_errors(),
                    chunks: r.chunks(),
                    exit_code: r.exit_code().unwrap_or(ExitCode::Unflushed),
                })
                .collect(),
        }
    }

    /// Stop capture and close every recorder. Idempotent.
    pub fn close(&mut self) -> SessionReport {
        if self.closed {
            return self.report();
        }
        self.shutdown()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.closed && !self.recorders.is_empty() {
            self.shutdown();
        }
    }
}
