//! Per-region asynchronous writer.
//!
//! The writer thread is the sole owner of its region's `StorageHandle`. It pops frames
//! from the region's data channel in FIFO order and writes them; when the channel is
//! closed by the recorder it keeps receiving until the channel reports disconnection,
//! which only happens once every buffered frame has been delivered. The storage handle
//! is then closed exactly once.
//!
//! Write failures are counted and logged with region, sequence and timestamp; the next
//! frame is written as usual. A close failure is logged and the thread still finishes.
//! A panic while draining closes the handle first, then keeps unwinding.

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::logctx::LogContext;
use crate::storage::{self, chunk_stem, ExtraData, StorageHandle};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Counters shared between a writer thread and its observers.
#[derive(Debug)]
pub struct WriterStats {
    saved: AtomicU64,
    write_errors: AtomicU64,
    chunk: AtomicI64,
    snapshots: AtomicU64,
    alive: AtomicBool,
    finished: AtomicBool,
}

impl WriterStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            saved: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            chunk: AtomicI64::new(-1),
            snapshots: AtomicU64::new(0),
            alive: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    pub fn n_saved_frames(&self) -> u64 {
        self.saved.load(Ordering::SeqCst)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::SeqCst)
    }

    /// Last chunk index seen after a write; `-1` before the first frame.
    pub fn current_chunk(&self) -> i64 {
        self.chunk.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// True once the queue was drained and the storage handle closed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub framerate: f64,
    /// Capacity of the data channel, for buffer usage reports.
    pub capacity: usize,
    /// Seconds of capture time between diagnostic log lines.
    pub info_interval_s: f64,
    /// Directory receiving `{chunk:06}.png` rollover snapshots. Skipped if it does not exist.
    pub snapshot_dir: PathBuf,
}

/// Fixed-length window of recent samples.
#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<f64>,
    len: usize,
}

impl RollingWindow {
    fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            samples: VecDeque::with_capacity(len),
            len,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.len {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Handle to a running writer thread.
pub struct AsyncWriter {
    idx: usize,
    stats: Arc<WriterStats>,
    join: Option<JoinHandle<()>>,
    log: LogContext,
}

impl AsyncWriter {
    /// Start the writer thread `writer-{idx}`.
    pub fn spawn(
        idx: usize,
        handle: Box<dyn StorageHandle>,
        frames: Receiver<Frame>,
        extra: Receiver<ExtraData>,
        config: WriterConfig,
        stats: Arc<WriterStats>,
        log: LogContext,
    ) -> Result<Self, PipelineError> {
        let window = (10.0 * config.framerate).round().max(1.0) as usize;
        let mut worker = Worker {
            idx,
            handle,
            frames,
            extra,
            latency_ms: RollingWindow::new(window),
            size_kib: RollingWindow::new(window),
            last_chunk: -1,
            last_info_ts: None,
            config,
            stats: stats.clone(),
            log: log.clone(),
        };
        stats.alive.store(true, Ordering::SeqCst);
        let join = std::thread::Builder::new()
            .name(format!("writer-{}", idx))
            .spawn(move || worker.run())
            .map_err(|source| {
                stats.alive.store(false, Ordering::SeqCst);
                PipelineError::Spawn {
                    region: idx,
                    role: "writer",
                    source,
                }
            })?;
        Ok(Self {
            idx,
            stats,
            join: Some(join),
            log,
        })
    }

    pub fn stats(&self) -> &Arc<WriterStats> {
        &self.stats
    }

    pub fn is_alive(&self) -> bool {
        self.stats.is_alive()
    }

    pub fn is_finished(&self) -> bool {
        self.stats.is_finished()
    }

    /// Wait for the thread. Returns false if it panicked.
    pub fn join(&mut self) -> bool {
        match self.join.take() {
            Some(join) => match join.join() {
                Ok(()) => true,
                Err(_) => {
                    log::error!(
                        target: self.log.target(),
                        "roi {}: writer thread panicked",
                        self.idx
                    );
                    false
                }
            },
            None => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Writer thread
// ----------------------------------------------------------------------------

struct Worker {
    idx: usize,
    handle: Box<dyn StorageHandle>,
    frames: Receiver<Frame>,
    extra: Receiver<ExtraData>,
    latency_ms: RollingWindow,
    size_kib: RollingWindow,
    last_chunk: i64,
    last_info_ts: Option<f64>,
    config: WriterConfig,
    stats: Arc<WriterStats>,
    log: LogContext,
}

/// Clears `alive` when the thread exits, including by panic.
struct AliveGuard(Arc<WriterStats>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

impl Worker {
    fn run(&mut self) {
        let _guard = AliveGuard(self.stats.clone());
        log::debug!(target: self.log.target(), "roi {}: writer started", self.idx);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.drain())) {
            log::error!(
                target: self.log.target(),
                "roi {}: writer panicked, closing storage before unwinding",
                self.idx
            );
            self.close_storage();
            panic::resume_unwind(payload);
        }
        self.finish();
    }

    fn drain(&mut self) {
        loop {
            self.forward_extra_data();
            match self.frames.recv_timeout(IDLE_POLL) {
                Ok(frame) => self.write(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.forward_extra_data();
    }

    fn write(&mut self, frame: Frame) {
        let started = Instant::now();
        let result = self
            .handle
            .add_image(frame.image(), frame.sequence(), frame.timestamp());
        match result {
            Ok(encoded) => {
                self.latency_ms
                    .push(started.elapsed().as_secs_f64() * 1000.0);
                self.size_kib.push(encoded as f64 / 1024.0);
                self.stats.saved.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                let errors = self.stats.write_errors.fetch_add(1, Ordering::SeqCst) + 1;
                log::error!(
                    target: self.log.target(),
                    "roi {}: failed to write frame {} (t={:.3}s): {} [{} write error(s)]",
                    self.idx,
                    frame.sequence(),
                    frame.timestamp(),
                    err,
                    errors
                );
            }
        }

        let chunk = self.handle.current_chunk_index();
        self.stats.chunk.store(chunk, Ordering::SeqCst);
        if chunk > self.last_chunk {
            self.last_chunk = chunk;
            self.snapshot(chunk, &frame);
        }
        self.report(frame.timestamp());
    }

    fn snapshot(&self, chunk: i64, frame: &Frame) {
        if !self.config.snapshot_dir.is_dir() {
            return;
        }
        let path = self
            .config
            .snapshot_dir
            .join(format!("{}.png", chunk_stem(chunk)));
        match storage::save_png(&path, frame.image()) {
            Ok(_) => {
                self.stats.snapshots.fetch_add(1, Ordering::SeqCst);
                log::debug!(
                    target: self.log.target(),
                    "roi {}: chunk {} started, snapshot {}",
                    self.idx,
                    chunk,
                    path.display()
                );
            }
            Err(err) => log::warn!(
                target: self.log.target(),
                "roi {}: snapshot for chunk {} failed: {}",
                self.idx,
                chunk,
                err
            ),
        }
    }

    fn report(&mut self, timestamp: f64) {
        let last = *self.last_info_ts.get_or_insert(timestamp);
        if timestamp - last < self.config.info_interval_s {
            return;
        }
        self.last_info_ts = Some(timestamp);
        log::info!(
            target: self.log.target(),
            "roi {}: write {:.2} ms avg, {:.2} KiB/frame avg, buffer {} / {}, chunk {}",
            self.idx,
            self.latency_ms.mean(),
            self.size_kib.mean(),
            self.frames.len(),
            self.config.capacity,
            self.last_chunk
        );
    }

    fn forward_extra_data(&mut self) {
        loop {
            match self.extra.try_recv() {
                Ok(data) => {
                    if let Err(err) = self.handle.add_extra_data(&data) {
                        log::warn!(
                            target: self.log.target(),
                            "roi {}: failed to store extra data (t={:.3}s): {}",
                            self.idx,
                            data.timestamp,
                            err
                        );
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn close_storage(&mut self) {
        if let Err(err) = self.handle.close() {
            log::error!(
                target: self.log.target(),
                "roi {}: closing storage failed: {}",
                self.idx,
                err
            );
        }
    }

    fn finish(&mut self) {
        self.close_storage();
        log::info!(
            target: self.log.target(),
            "roi {}: writer finished, {} frame(s) saved, {} write error(s), last chunk {}",
            self.idx,
            self.stats.n_saved_frames(),
            self.stats.write_errors(),
            self.last_chunk
        );
        self.stats.finished.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Image, ImageShape};
    use crate::storage::{MemoryStorage, StorageBackend, StoreSpec};
    use crossbeam_channel::bounded;
    use std::path::Path;

    fn open(storage: &MemoryStorage, chunk_size: u64) -> Box<dyn StorageHandle> {
        storage
            .open(&StoreSpec {
                path: PathBuf::from("mem_ROI_0"),
                framerate: 10.0,
                shape: ImageShape::new(2, 2, 1),
                chunk_size,
                log: LogContext::for_region(0),
            })
            .unwrap()
    }

    fn config(snapshot_dir: PathBuf) -> WriterConfig {
        WriterConfig {
            framerate: 10.0,
            capacity: 8,
            info_interval_s: 2.0,
            snapshot_dir,
        }
    }

    fn wait_finished(writer: &mut AsyncWriter) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !writer.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(writer.join());
    }

    #[test]
    fn rolling_window_keeps_most_recent_samples() {
        let mut window = RollingWindow::new(2);
        window.push(1.0);
        window.push(2.0);
        window.push(6.0);
        assert_eq!(window.mean(), 4.0);
        assert_eq!(RollingWindow::new(0).mean(), 0.0);
    }

    #[test]
    fn drains_buffered_frames_after_channel_closes() {
        let storage = MemoryStorage::new();
        let (tx, rx) = bounded(8);
        let (_extra_tx, extra_rx) = bounded(1);
        for seq in 0..5 {
            tx.send(Frame::new(seq as f64 / 10.0, seq, Image::filled(2, 2, 1, 0)))
                .unwrap();
        }
        drop(tx);

        let stats = WriterStats::new();
        let mut writer = AsyncWriter::spawn(
            0,
            open(&storage, 100),
            rx,
            extra_rx,
            config(PathBuf::from("/nonexistent")),
            stats.clone(),
            LogContext::for_region(0),
        )
        .unwrap();
        wait_finished(&mut writer);

        assert!(!stats.is_alive());
        assert_eq!(stats.n_saved_frames(), 5);
        let rec = storage.recording(Path::new("mem_ROI_0")).unwrap();
        assert_eq!(rec.sequences(), vec![0, 1, 2, 3, 4]);
        assert_eq!(rec.close_calls, 1);
    }

    #[test]
    fn write_errors_do_not_stop_the_writer() {
        let storage = MemoryStorage::new().with_failures([1, 3]);
        let (tx, rx) = bounded(8);
        let (_extra_tx, extra_rx) = bounded(1);
        for seq in 0..5 {
            tx.send(Frame::new(0.0, seq, Image::filled(2, 2, 1, 0))).unwrap();
        }
        drop(tx);
        let stats = WriterStats::new();
        let mut writer = AsyncWriter::spawn(
            1,
            open(&storage, 100),
            rx,
            extra_rx,
            config(PathBuf::from("/nonexistent")),
            stats.clone(),
            LogContext::for_region(1),
        )
        .unwrap();
        wait_finished(&mut writer);
        assert_eq!(stats.n_saved_frames(), 3);
        assert_eq!(stats.write_errors(), 2);
    }

    /// Panics on one sequence number and counts `close` calls.
    struct PanickingHandle {
        panic_on: u64,
        closes: Arc<AtomicU64>,
    }

    impl StorageHandle for PanickingHandle {
        fn add_image(
            &mut self,
            image: &Image,
            sequence: u64,
            _timestamp: f64,
        ) -> Result<usize, crate::error::StorageError> {
            assert_ne!(sequence, self.panic_on, "encoder state corrupted");
            Ok(image.byte_len())
        }

        fn current_chunk_index(&self) -> i64 {
            0
        }

        fn add_extra_data(&mut self, _data: &ExtraData) -> Result<(), crate::error::StorageError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), crate::error::StorageError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn panic_while_draining_still_closes_storage() {
        let closes = Arc::new(AtomicU64::new(0));
        let (tx, rx) = bounded(8);
        let (_extra_tx, extra_rx) = bounded(1);
        for seq in 0..3 {
            tx.send(Frame::new(0.0, seq, Image::filled(2, 2, 1, 0))).unwrap();
        }
        drop(tx);

        let stats = WriterStats::new();
        let mut writer = AsyncWriter::spawn(
            2,
            Box::new(PanickingHandle {
                panic_on: 1,
                closes: closes.clone(),
            }),
            rx,
            extra_rx,
            config(PathBuf::from("/nonexistent")),
            stats.clone(),
            LogContext::for_region(2),
        )
        .unwrap();

        assert!(!writer.join());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(stats.n_saved_frames(), 1);
        assert!(!stats.is_finished());
        assert!(!stats.is_alive());
    }

    #[test]
    fn snapshots_one_png_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();
        let (tx, rx) = bounded(16);
        let (extra_tx, extra_rx) = bounded(1);
        for seq in 0..7 {
            tx.send(Frame::new(0.0, seq, Image::filled(2, 2, 1, seq as u8)))
                .unwrap();
        }
        let mut values = std::collections::BTreeMap::new();
        values.insert("lux".to_string(), 3.0);
        extra_tx
            .send(ExtraData {
                timestamp: 0.0,
                values,
            })
            .unwrap();
        drop(tx);

        let stats = WriterStats::new();
        let mut writer = AsyncWriter::spawn(
            0,
            open(&storage, 3),
            rx,
            extra_rx,
            config(dir.path().to_path_buf()),
            stats.clone(),
            LogContext::for_region(0),
        )
        .unwrap();
        wait_finished(&mut writer);

        assert_eq!(stats.current_chunk(), 2);
        assert_eq!(stats.snapshots(), 3);
        for chunk in 0..3 {
            assert!(dir.path().join(format!("{:06}.png", chunk)).is_file());
        }
        let first_of_second = image::open(dir.path().join("000001.png")).unwrap();
        assert_eq!(first_of_second.to_luma8().get_pixel(0, 0).0, [3]);
        let rec = storage.recording(Path::new("mem_ROI_0")).unwrap();
        assert_eq!(rec.extra.len(), 1);
    }
}
