//! Per-region recorder.
//!
//! A `Recorder` owns one region's bounded data channel, its single-slot control channel,
//! and the `AsyncWriter` draining the data channel into storage.
//!
//! Lifecycle: `Created -> Open -> Running -> Stopping -> Closed`.
//! - `open()` opens the storage handle and starts the writer thread.
//! - `start()` starts the supervisor thread, which polls the stop conditions every
//!   `poll_interval` (elapsed duration, saved frame count, `Stop` on the control channel)
//!   and the optional sensor.
//! - Stopping closes the data channel. The writer drains what is buffered, closes the
//!   storage handle and finishes; the recorder then checks that both channels are empty
//!   and records the exit code.
//!
//! Frames are pushed by a single producer. With `OverflowPolicy::DropOldest` a push onto a
//! full channel evicts the oldest buffered frame; with `OverflowPolicy::Block` it waits
//! for the writer to free a slot.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::{Frame, ImageShape};
use crate::logctx::LogContext;
use crate::sensor::Sensor;
use crate::storage::{chunk_size_for, ExtraData, StorageBackend, StoreSpec};
use crate::writer::{AsyncWriter, WriterConfig, WriterStats};

/// Loss is logged on the first dropped frame and every this many after.
const LOSS_LOG_EVERY: u64 = 100;
/// Interval between "still draining" log lines while waiting on a writer.
const STALL_LOG_EVERY: Duration = Duration::from_secs(5);
const BLOCK_RETRY: Duration = Duration::from_millis(100);
const EXTRA_DATA_SLOTS: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered frame; capture never stalls.
    #[default]
    DropOldest,
    /// Wait for the writer; no frame is ever lost.
    Block,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => f.write_str("drop-oldest"),
            OverflowPolicy::Block => f.write_str("block"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" | "drop" => Ok(OverflowPolicy::DropOldest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!(
                "unknown overflow policy '{}' (expected drop-oldest or block)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecorderState {
    Created,
    Open,
    Running,
    Stopping,
    Closed,
}

impl RecorderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderState::Created => "created",
            RecorderState::Open => "open",
            RecorderState::Running => "running",
            RecorderState::Stopping => "stopping",
            RecorderState::Closed => "closed",
        }
    }
}

/// Outcome of a recorder shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Every buffered frame was handed to storage and the handle closed.
    Clean,
    /// Frames or control messages were left behind, or the writer died.
    Unflushed,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Clean => 0,
            ExitCode::Unflushed => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub framerate: f64,
    /// Data channel capacity.
    pub buffer_size: usize,
    pub overflow: OverflowPolicy,
    /// Stop after this much wall time since `start()`.
    pub duration: Option<Duration>,
    /// Stop once this many frames were saved.
    pub max_frames: Option<u64>,
    pub chunk_duration_s: f64,
    pub info_interval_s: f64,
    pub extra_data_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            framerate: 30.0,
            buffer_size: 500,
            overflow: OverflowPolicy::DropOldest,
            duration: None,
            max_frames: None,
            chunk_duration_s: 300.0,
            info_interval_s: 2.0,
            extra_data_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Stop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the recorder handle and its supervisor thread.
struct Shared {
    idx: usize,
    config: RecorderConfig,
    log: LogContext,
    state: Mutex<RecorderState>,
    started_at: Mutex<Option<Instant>>,
    stop_requested: AtomicBool,
    lost: AtomicU64,
    /// Producer side of the data channel; `None` once closed.
    intake: Mutex<Option<Sender<Frame>>>,
    /// Consumer clone used for eviction and depth reports.
    queue: Receiver<Frame>,
    control: Receiver<Control>,
    stats: Arc<WriterStats>,
    writer: Mutex<Option<AsyncWriter>>,
    exit_code: Mutex<Option<ExitCode>>,
}

impl Shared {
    fn state(&self) -> RecorderState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RecorderState) {
        let mut current = lock(&self.state);
        if state > *current {
            log::debug!(
                target: self.log.target(),
                "roi {}: {} -> {}",
                self.idx,
                current.as_str(),
                state.as_str()
            );
            *current = state;
        }
    }

    fn should_stop(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(max) = self.config.max_frames {
            if self.stats.n_saved_frames() >= max {
                return true;
            }
        }
        match (self.config.duration, *lock(&self.started_at)) {
            (Some(limit), Some(started)) => started.elapsed() >= limit,
            _ => false,
        }
    }

    fn close_intake(&self) {
        lock(&self.intake).take();
    }

    /// Close the data channel, wait for the writer to drain, record the exit code.
    fn finish(&self) -> ExitCode {
        if let Some(code) = *lock(&self.exit_code) {
            return code;
        }
        self.set_state(RecorderState::Stopping);
        self.close_intake();

        let writer = lock(&self.writer).take();
        let writer_ok = match writer {
            Some(mut writer) => {
                let started = Instant::now();
                let mut last_log = Instant::now();
                while !writer.is_finished() && writer.is_alive() {
                    if last_log.elapsed() >= STALL_LOG_EVERY {
                        log::warn!(
                            target: self.log.target(),
                            "roi {}: waiting on writer for {:.0}s, {} frame(s) still buffered",
                            self.idx,
                            started.elapsed().as_secs_f64(),
                            self.queue.len()
                        );
                        last_log = Instant::now();
                    }
                    std::thread::sleep(self.config.poll_interval.min(BLOCK_RETRY));
                }
                writer.join() && writer.is_finished()
            }
            None => true,
        };

        while self.control.try_recv().is_ok() {}
        let leftover = self.queue.len();
        let code = if writer_ok && leftover == 0 && self.control.is_empty() {
            ExitCode::Clean
        } else {
            log::warn!(
                target: self.log.target(),
                "roi {}: stopped with {} unflushed frame(s)",
                self.idx,
                leftover
            );
            ExitCode::Unflushed
        };
        *lock(&self.exit_code) = Some(code);
        self.set_state(RecorderState::Closed);
        log::info!(
            target: self.log.target(),
            "roi {}: closed ({:?}), saved {}, lost {}",
            self.idx,
            code,
            self.stats.n_saved_frames(),
            self.lost.load(Ordering::SeqCst)
        );
        code
    }
}

pub struct Recorder {
    shared: Arc<Shared>,
    path: PathBuf,
    shape: ImageShape,
    backend: Arc<dyn StorageBackend>,
    control_tx: Sender<Control>,
    extra_tx: Option<Sender<ExtraData>>,
    extra_rx: Option<Receiver<ExtraData>>,
    sensor: Option<Arc<dyn Sensor>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Recorder {
    pub fn new(
        idx: usize,
        path: impl Into<PathBuf>,
        shape: ImageShape,
        backend: Arc<dyn StorageBackend>,
        config: RecorderConfig,
        log: LogContext,
    ) -> Self {
        let (data_tx, data_rx) = bounded(config.buffer_size.max(1));
        let (control_tx, control_rx) = bounded(1);
        let (extra_tx, extra_rx) = bounded(EXTRA_DATA_SLOTS);
        let shared = Arc::new(Shared {
            idx,
            config,
            log,
            state: Mutex::new(RecorderState::Created),
            started_at: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            lost: AtomicU64::new(0),
            intake: Mutex::new(Some(data_tx)),
            queue: data_rx,
            control: control_rx,
            stats: WriterStats::new(),
            writer: Mutex::new(None),
            exit_code: Mutex::new(None),
        });
        Self {
            shared,
            path: path.into(),
            shape,
            backend,
            control_tx,
            extra_tx: Some(extra_tx),
            extra_rx: Some(extra_rx),
            sensor: None,
            supervisor: None,
        }
    }

    /// Poll `sensor` every `extra_data_interval` while running.
    pub fn with_sensor(mut self, sensor: Arc<dyn Sensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn index(&self) -> usize {
        self.shared.idx
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> RecorderState {
        self.shared.state()
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.shared.config.overflow
    }

    /// Open storage and start the writer. Storage failures are fatal for the region.
    pub fn open(&mut self) -> Result<(), PipelineError> {
        let state = self.state();
        if state != RecorderState::Created {
            return Err(self.state_error("open", state));
        }
        let idx = self.shared.idx;
        let config = &self.shared.config;
        let spec = StoreSpec {
            path: self.path.clone(),
            framerate: config.framerate,
            shape: self.shape,
            chunk_size: chunk_size_for(config.chunk_duration_s, config.framerate),
            log: self.shared.log.clone(),
        };
        let handle = self
            .backend
            .open(&spec)
            .map_err(|source| PipelineError::Storage {
                region: idx,
                source,
            })?;
        let extra_rx = self
            .extra_rx
            .take()
            .ok_or_else(|| self.state_error("open", state))?;
        let writer = AsyncWriter::spawn(
            idx,
            handle,
            self.shared.queue.clone(),
            extra_rx,
            WriterConfig {
                framerate: config.framerate,
                capacity: config.buffer_size,
                info_interval_s: config.info_interval_s,
                snapshot_dir: self.path.clone(),
            },
            self.shared.stats.clone(),
            self.shared.log.clone(),
        )?;
        *lock(&self.shared.writer) = Some(writer);
        self.shared.set_state(RecorderState::Open);
        log::info!(
            target: self.shared.log.target(),
            "roi {}: recording {} {} to {} ({}, chunks of {} frames, buffer {})",
            idx,
            self.shape,
            self.backend.name(),
            self.path.display(),
            config.overflow,
            spec.chunk_size,
            config.buffer_size
        );
        Ok(())
    }

    /// Start the supervisor. The duration limit counts from here.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let state = self.state();
        if state != RecorderState::Open {
            return Err(self.state_error("start", state));
        }
        *lock(&self.shared.started_at) = Some(Instant::now());
        let shared = self.shared.clone();
        let sensor = self.sensor.clone();
        let extra_tx = self.extra_tx.take();
        let idx = shared.idx;
        let join = std::thread::Builder::new()
            .name(format!("recorder-{}", idx))
            .spawn(move || supervise(shared, sensor, extra_tx))
            .map_err(|source| PipelineError::Spawn {
                region: idx,
                role: "recorder",
                source,
            })?;
        self.supervisor = Some(join);
        self.shared.set_state(RecorderState::Running);
        Ok(())
    }

    /// True when any stop condition holds. No side effects.
    pub fn should_stop(&self) -> bool {
        self.shared.should_stop()
    }

    /// Queue a frame. Never blocks under `DropOldest`.
    pub fn write(&self, frame: Frame) -> Result<(), PipelineError> {
        let intake = lock(&self.shared.intake);
        let Some(tx) = intake.as_ref() else {
            return Err(self.state_error("write", self.state()));
        };
        match self.shared.config.overflow {
            OverflowPolicy::DropOldest => self.push_drop_oldest(tx, frame),
            OverflowPolicy::Block => self.push_blocking(tx, frame),
        }
    }

    fn push_drop_oldest(&self, tx: &Sender<Frame>, mut frame: Frame) -> Result<(), PipelineError> {
        // The second try catches a slot the writer freed since the first; only then evict.
        for attempt in 0..3 {
            match tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => frame = back,
                Err(TrySendError::Disconnected(_)) => {
                    return Err(self.state_error("write", self.state()))
                }
            }
            if attempt == 1 {
                if let Ok(evicted) = self.shared.queue.try_recv() {
                    self.count_lost(evicted.sequence());
                }
            }
        }
        self.count_lost(frame.sequence());
        Ok(())
    }

    fn push_blocking(&self, tx: &Sender<Frame>, mut frame: Frame) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut last_log = Instant::now();
        loop {
            match tx.send_timeout(frame, BLOCK_RETRY) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => frame = back,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(self.state_error("write", self.state()))
                }
            }
            if !self.shared.stats.is_alive() {
                self.count_lost(frame.sequence());
                return Err(self.state_error("write", "writer-dead"));
            }
            if last_log.elapsed() >= STALL_LOG_EVERY {
                log::warn!(
                    target: self.shared.log.target(),
                    "roi {}: capture blocked for {:.0}s on a full buffer ({} frames)",
                    self.shared.idx,
                    started.elapsed().as_secs_f64(),
                    self.shared.queue.len()
                );
                last_log = Instant::now();
            }
        }
    }

    fn count_lost(&self, sequence: u64) {
        let lost = self.shared.lost.fetch_add(1, Ordering::SeqCst) + 1;
        if lost == 1 || lost % LOSS_LOG_EVERY == 0 {
            log::warn!(
                target: self.shared.log.target(),
                "roi {}: buffer full, dropped frame {} ({} lost so far)",
                self.shared.idx,
                sequence,
                lost
            );
        }
    }

    /// Frames currently buffered. Does not pause the channel.
    pub fn report_cache_usage(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn buffered_frames(&self) -> usize {
        self.report_cache_usage()
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.buffer_size.max(1)
    }

    pub fn n_saved_frames(&self) -> u64 {
        self.shared.stats.n_saved_frames()
    }

    pub fn lost_frames(&self) -> u64 {
        self.shared.lost.load(Ordering::SeqCst)
    }

    pub fn write_errors(&self) -> u64 {
        self.shared.stats.write_errors()
    }

    /// Chunks started so far.
    pub fn chunks(&self) -> u64 {
        (self.shared.stats.current_chunk() + 1).max(0) as u64
    }

    pub fn is_writer_alive(&self) -> bool {
        self.shared.stats.is_alive()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.shared.exit_code).is_some()
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        *lock(&self.shared.exit_code)
    }

    /// Ask the supervisor to stop without waiting.
    pub fn request_stop(&self) {
        // Held across the send so no Stop lands after `finish` drained the control slot.
        let state = lock(&self.shared.state);
        if *state < RecorderState::Stopping {
            // A full slot already carries a Stop.
            let _ = self.control_tx.try_send(Control::Stop);
        }
    }

    /// Stop and wait for the writer to drain. Idempotent.
    pub fn close(&mut self) -> ExitCode {
        if let Some(code) = self.exit_code() {
            self.join_supervisor();
            return code;
        }
        let code = match self.state() {
            RecorderState::Created => {
                self.shared.close_intake();
                let code = if self.shared.queue.is_empty() {
                    ExitCode::Clean
                } else {
                    ExitCode::Unflushed
                };
                *lock(&self.shared.exit_code) = Some(code);
                self.shared.set_state(RecorderState::Closed);
                code
            }
            RecorderState::Open => self.shared.finish(),
            _ => {
                self.request_stop();
                self.wait_finished(None)
            }
        };
        self.join_supervisor();
        code
    }

    /// Wait up to `timeout` for the recorder to finish on its own.
    /// Returns `Unflushed` if it is still running; nothing is killed.
    pub fn join(&mut self, timeout: Duration) -> ExitCode {
        if self.state() == RecorderState::Created || self.state() == RecorderState::Open {
            return self.exit_code().unwrap_or(ExitCode::Unflushed);
        }
        let code = self.wait_finished(Some(timeout));
        if self.is_finished() {
            self.join_supervisor();
        }
        code
    }

    fn wait_finished(&self, timeout: Option<Duration>) -> ExitCode {
        let started = Instant::now();
        let mut last_log = Instant::now();
        loop {
            if let Some(code) = self.exit_code() {
                return code;
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return ExitCode::Unflushed;
                }
            }
            if last_log.elapsed() >= STALL_LOG_EVERY {
                log::warn!(
                    target: self.shared.log.target(),
                    "roi {}: still stopping after {:.0}s, {} frame(s) buffered",
                    self.shared.idx,
                    started.elapsed().as_secs_f64(),
                    self.report_cache_usage()
                );
                last_log = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn join_supervisor(&mut self) {
        if let Some(join) = self.supervisor.take() {
            if join.join().is_err() {
                log::error!(
                    target: self.shared.log.target(),
                    "roi {}: supervisor thread panicked",
                    self.shared.idx
                );
            }
        }
    }

    fn state_error(&self, action: &'static str, state: impl StateName) -> PipelineError {
        PipelineError::State {
            region: self.shared.idx,
            action,
            state: state.name(),
        }
    }

    /// Number of control messages pending.
    pub fn pending_control(&self) -> usize {
        self.shared.control.len()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.supervisor.is_some() || self.state() == RecorderState::Open {
            self.close();
        }
    }
}

trait StateName {
    fn name(&self) -> &'static str;
}

impl StateName for RecorderState {
    fn name(&self) -> &'static str {
        self.as_str()
    }
}

impl StateName for &'static str {
    fn name(&self) -> &'static str {
        self
    }
}

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

fn supervise(
    shared: Arc<Shared>,
    sensor: Option<Arc<dyn Sensor>>,
    extra_tx: Option<Sender<ExtraData>>,
) {
    let mut last_query: Option<Instant> = None;
    loop {
        match shared.control.recv_timeout(shared.config.poll_interval) {
            Ok(Control::Stop) => {
                log::debug!(target: shared.log.target(), "roi {}: stop received", shared.idx);
                shared.stop_requested.store(true, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        if shared.should_stop() {
            break;
        }
        if !shared.stats.is_alive() {
            log::error!(
                target: shared.log.target(),
                "roi {}: writer exited unexpectedly",
                shared.idx
            );
            break;
        }
        if let (Some(sensor), Some(tx)) = (&sensor, &extra_tx) {
            let due = last_query
                .map(|t| t.elapsed() >= shared.config.extra_data_interval)
                .unwrap_or(true);
            if due {
                last_query = Some(Instant::now());
                poll_sensor(&shared, sensor.as_ref(), tx);
            }
        }
    }
    drop(extra_tx);
    shared.finish();
}

fn poll_sensor(shared: &Shared, sensor: &dyn Sensor, tx: &Sender<ExtraData>) {
    match sensor.query() {
        Some(data) => {
            if tx.try_send(data).is_err() {
                log::warn!(
                    target: shared.log.target(),
                    "roi {}: extra data from {} dropped, writer is behind",
                    shared.idx,
                    sensor.name()
                );
            }
        }
        None => log::warn!(
            target: shared.log.target(),
            "roi {}: no reading from sensor {}",
            shared.idx,
            sensor.name()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Image;
    use crate::storage::MemoryStorage;

    fn recorder(storage: &MemoryStorage, config: RecorderConfig) -> Recorder {
        Recorder::new(
            0,
            "unit_ROI_0",
            ImageShape::new(2, 2, 1),
            Arc::new(storage.clone()),
            config,
            LogContext::for_region(0),
        )
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq as f64 / 30.0, seq, Image::filled(2, 2, 1, 0))
    }

    #[test]
    fn overflow_policy_parses() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("BLOCK".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert!("spill".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::DropOldest);
    }

    #[test]
    fn drop_oldest_accounts_every_frame_against_a_live_writer() {
        let storage = MemoryStorage::new();
        let mut rec = recorder(
            &storage,
            RecorderConfig {
                buffer_size: 2,
                poll_interval: Duration::from_millis(5),
                ..RecorderConfig::default()
            },
        );
        rec.open().unwrap();
        rec.start().unwrap();
        for seq in 0..2_000 {
            rec.write(frame(seq)).unwrap();
            assert!(rec.buffered_frames() <= 2);
        }
        assert_eq!(rec.close(), ExitCode::Clean);

        let sequences = storage.recording(Path::new("unit_ROI_0")).unwrap().sequences();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sequences.len() as u64, rec.n_saved_frames());
        assert_eq!(rec.n_saved_frames() + rec.lost_frames(), 2_000);
        assert_eq!(sequences.last(), Some(&1_999));
    }

    #[test]
    fn close_before_open_discards_nothing_silently() {
        let storage = MemoryStorage::new();
        let mut empty = recorder(&storage, RecorderConfig::default());
        assert_eq!(empty.close(), ExitCode::Clean);

        let mut pending = recorder(&storage, RecorderConfig::default());
        pending.write(frame(0)).unwrap();
        assert_eq!(pending.close(), ExitCode::Unflushed);
        assert_eq!(pending.state(), RecorderState::Closed);
    }

    #[test]
    fn lifecycle_rejects_out_of_order_calls() {
        let storage = MemoryStorage::new();
        let mut rec = recorder(&storage, RecorderConfig::default());
        assert!(matches!(rec.start(), Err(PipelineError::State { .. })));
        rec.open().unwrap();
        assert!(matches!(rec.open(), Err(PipelineError::State { .. })));
        rec.start().unwrap();
        assert_eq!(rec.state(), RecorderState::Running);
        assert_eq!(rec.close(), ExitCode::Clean);
        assert!(matches!(rec.write(frame(1)), Err(PipelineError::State { .. })));
    }

    #[test]
    fn open_failure_is_a_storage_error() {
        let storage = MemoryStorage::new().failing_open();
        let mut rec = recorder(&storage, RecorderConfig::default());
        assert!(matches!(rec.open(), Err(PipelineError::Storage { region: 0, .. })));
        assert_eq!(rec.state(), RecorderState::Created);
    }

    #[test]
    fn should_stop_on_max_frames() {
        let storage = MemoryStorage::new();
        let mut rec = recorder(
            &storage,
            RecorderConfig {
                max_frames: Some(3),
                poll_interval: Duration::from_millis(10),
                ..RecorderConfig::default()
            },
        );
        rec.open().unwrap();
        rec.start().unwrap();
        assert!(!rec.should_stop());
        for seq in 0..3 {
            rec.write(frame(seq)).unwrap();
        }
        assert_eq!(rec.join(Duration::from_secs(5)), ExitCode::Clean);
        assert!(rec.should_stop());
        assert_eq!(rec.n_saved_frames(), 3);
    }

    #[test]
    fn should_stop_on_duration() {
        let storage = MemoryStorage::new();
        let mut rec = recorder(
            &storage,
            RecorderConfig {
                duration: Some(Duration::from_millis(50)),
                poll_interval: Duration::from_millis(10),
                ..RecorderConfig::default()
            },
        );
        rec.open().unwrap();
        assert!(!rec.should_stop());
        rec.start().unwrap();
        assert_eq!(rec.join(Duration::from_secs(5)), ExitCode::Clean);
        assert_eq!(rec.state(), RecorderState::Closed);
    }

    #[test]
    fn join_times_out_without_stopping() {
        let storage = MemoryStorage::new();
        let mut rec = recorder(&storage, RecorderConfig::default());
        rec.open().unwrap();
        rec.start().unwrap();
        assert_eq!(rec.join(Duration::from_millis(30)), ExitCode::Unflushed);
        assert_eq!(rec.state(), RecorderState::Running);
        assert_eq!(rec.close(), ExitCode::Clean);
    }

    #[test]
    fn sensor_readings_reach_storage() {
        let storage = MemoryStorage::new();
        let sensor = crate::sensor::StaticSensor::new([("temperature".to_string(), 22.0)]);
        let mut rec = recorder(
            &storage,
            RecorderConfig {
                poll_interval: Duration::from_millis(10),
                ..RecorderConfig::default()
            },
        )
        .with_sensor(sensor);
        rec.open().unwrap();
        rec.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(rec.close(), ExitCode::Clean);
        let recording = storage.recording(Path::new("unit_ROI_0")).unwrap();
        assert_eq!(recording.extra.len(), 1);
        assert_eq!(recording.extra[0].values["temperature"], 22.0);
    }
}
