//! In-memory storage backend.
//!
//! Records every frame written per region path instead of encoding it. Used by tests and
//! dry runs. A `MemoryStorage` is a cheap handle: clones share the same recordings.
//!
//! Fault injection:
//! - `with_write_delay`: sleep inside every `add_image` (slow disk)
//! - `with_gate`: block every `add_image` until the gate opens (stalled writer)
//! - `with_failures`: fail `add_image` for the listed sequence numbers
//! - `with_failures_at`: same, for one region path only
//! - `failing_open`: fail `open` (unrecoverable backend initialisation)

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{
    check_shape, ChunkCounter, ExtraData, StorageBackend, StorageHandle, StoreSpec,
};
use crate::error::StorageError;
use crate::frame::{Image, ImageShape};

#[derive(Clone, Debug, PartialEq)]
pub struct StoredFrame {
    pub sequence: u64,
    pub timestamp: f64,
    pub shape: ImageShape,
    pub chunk: i64,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryRecording {
    pub frames: Vec<StoredFrame>,
    pub extra: Vec<ExtraData>,
    pub chunk_size: u64,
    pub framerate: f64,
    /// Number of `close()` calls, including no-op repeats.
    pub close_calls: u32,
    /// Set by the first effective `close()`.
    pub closed: bool,
}

impl MemoryRecording {
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.sequence).collect()
    }

    /// Distinct chunk indexes written so far.
    pub fn chunk_count(&self) -> usize {
        let mut chunks: Vec<i64> = self.frames.iter().map(|f| f.chunk).collect();
        chunks.dedup();
        chunks.len()
    }
}

/// Latch that holds writers until opened.
#[derive(Debug, Default)]
pub struct WriteGate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl WriteGate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = true;
            self.changed.notify_all();
        }
    }

    fn wait(&self) -> Result<(), StorageError> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| StorageError::Backend("write gate lock poisoned".to_string()))?;
        while !*open {
            open = self
                .changed
                .wait(open)
                .map_err(|_| StorageError::Backend("write gate lock poisoned".to_string()))?;
        }
        Ok(())
    }
}

type Recordings = Arc<Mutex<BTreeMap<PathBuf, MemoryRecording>>>;

#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    recordings: Recordings,
    write_delay: Option<Duration>,
    gate: Option<Arc<WriteGate>>,
    failures: Arc<HashSet<u64>>,
    path_failures: Arc<BTreeMap<PathBuf, HashSet<u64>>>,
    fail_open: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn with_gate(mut self, gate: Arc<WriteGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail `add_image` for each listed sequence number.
    pub fn with_failures(mut self, sequences: impl IntoIterator<Item = u64>) -> Self {
        self.failures = Arc::new(sequences.into_iter().collect());
        self
    }

    /// Fail `add_image` for each listed sequence number written under `path`.
    pub fn with_failures_at(
        mut self,
        path: impl Into<PathBuf>,
        sequences: impl IntoIterator<Item = u64>,
    ) -> Self {
        Arc::make_mut(&mut self.path_failures)
            .entry(path.into())
            .or_default()
            .extend(sequences);
        self
    }

    fn fails(&self, path: &Path, sequence: u64) -> bool {
        self.failures.contains(&sequence)
            || self
                .path_failures
                .get(path)
                .is_some_and(|sequences| sequences.contains(&sequence))
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Snapshot of what was recorded under `path`.
    pub fn recording(&self, path: &Path) -> Option<MemoryRecording> {
        self.recordings.lock().ok()?.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.recordings
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, spec: &StoreSpec) -> Result<Box<dyn StorageHandle>, StorageError> {
        if self.fail_open {
            return Err(StorageError::Backend(format!(
                "cannot open {}: backend unavailable",
                spec.path.display()
            )));
        }
        let mut recordings = self
            .recordings
            .lock()
            .map_err(|_| StorageError::Backend("recordings lock poisoned".to_string()))?;
        recordings.insert(
            spec.path.clone(),
            MemoryRecording {
                chunk_size: spec.chunk_size,
                framerate: spec.framerate,
                ..MemoryRecording::default()
            },
        );
        Ok(Box::new(MemoryHandle {
            storage: self.clone(),
            path: spec.path.clone(),
            shape: spec.shape,
            counter: ChunkCounter::new(spec.chunk_size),
            closed: false,
        }))
    }
}

struct MemoryHandle {
    storage: MemoryStorage,
    path: PathBuf,
    shape: ImageShape,
    counter: ChunkCounter,
    closed: bool,
}

impl MemoryHandle {
    fn update<T>(&self, f: impl FnOnce(&mut MemoryRecording) -> T) -> Result<T, StorageError> {
        let mut recordings = self
            .storage
            .recordings
            .lock()
            .map_err(|_| StorageError::Backend("recordings lock poisoned".to_string()))?;
        let recording = recordings
            .get_mut(&self.path)
            .ok_or_else(|| StorageError::Backend(format!("{} vanished", self.path.display())))?;
        Ok(f(recording))
    }
}

impl StorageHandle for MemoryHandle {
    fn add_image(
        &mut self,
        image: &Image,
        sequence: u64,
        timestamp: f64,
    ) -> Result<usize, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if let Some(gate) = &self.storage.gate {
            gate.wait()?;
        }
        if let Some(delay) = self.storage.write_delay {
            std::thread::sleep(delay);
        }
        if self.storage.fails(&self.path, sequence) {
            return Err(StorageError::Encode(format!(
                "injected failure for frame {}",
                sequence
            )));
        }
        check_shape(self.shape, image)?;
        self.counter.advance();
        let stored = StoredFrame {
            sequence,
            timestamp,
            shape: image.shape(),
            chunk: self.counter.index(),
        };
        self.update(|r| r.frames.push(stored))?;
        Ok(image.byte_len())
    }

    fn current_chunk_index(&self) -> i64 {
        self.counter.index()
    }

    fn add_extra_data(&mut self, data: &ExtraData) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let data = data.clone();
        self.update(|r| r.extra.push(data))
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let first = !self.closed;
        self.closed = true;
        self.update(|r| {
            r.close_calls += 1;
            if first {
                r.closed = true;
            }
        })
    }
}
