//! Chunked output storage.
//!
//! A `StorageBackend` opens one `StorageHandle` per region. The handle is owned by that
//! region's writer thread and is the only thing allowed to touch the region's output
//! directory, apart from the writer's rollover snapshots (`{chunk:06}.png`).
//!
//! Every handle rolls over to a new chunk when the frame count of the current chunk
//! reaches `chunk_size`. The chunk index is `-1` until the first frame is written.
//!
//! Strategies are a closed set selected by `WriterFormat`:
//! - `ChunkedStore`: raw frame bytes per chunk plus a JSON frame index
//! - `RawImages`: one PNG per frame, one directory per chunk
//! - `Ffmpeg`: one encoded video file per chunk via an `ffmpeg` subprocess
//!
//! `memory::MemoryStorage` keeps frames in memory for tests.

pub mod chunked;
pub mod ffmpeg;
pub mod memory;
pub mod raw_images;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StorageError;
use crate::frame::{Image, ImageShape};
use crate::logctx::LogContext;

pub use chunked::{ChunkIndexEntry, ChunkedStore};
pub use ffmpeg::{FfmpegOptions, FfmpegStore};
pub use memory::MemoryStorage;
pub use raw_images::RawImageStore;

/// Name of the metadata file written by stores that keep one.
pub const METADATA_FILE: &str = "metadata.json";
/// Name of the append-only extra-data log.
pub const EXTRA_DATA_FILE: &str = "extra_data.jsonl";

/// Parameters for opening a region store.
#[derive(Clone, Debug)]
pub struct StoreSpec {
    pub path: PathBuf,
    pub framerate: f64,
    pub shape: ImageShape,
    /// Frames per chunk.
    pub chunk_size: u64,
    pub log: LogContext,
}

/// Frames per chunk for a chunk duration at a frame rate. Never less than one.
pub fn chunk_size_for(chunk_duration_s: f64, framerate: f64) -> u64 {
    let frames = (chunk_duration_s * framerate).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as u64
    } else {
        1
    }
}

/// Periodic non-frame metadata (e.g. environmental sensor readings).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    pub timestamp: f64,
    pub values: BTreeMap<String, f64>,
}

pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a handle writing under `spec.path`. Failure here is fatal for the region.
    fn open(&self, spec: &StoreSpec) -> Result<Box<dyn StorageHandle>, StorageError>;
}

pub trait StorageHandle: Send {
    /// Append a frame to the current chunk. Returns the encoded size in bytes.
    fn add_image(
        &mut self,
        image: &Image,
        sequence: u64,
        timestamp: f64,
    ) -> Result<usize, StorageError>;

    /// Index of the chunk the last frame went to; `-1` before the first frame.
    fn current_chunk_index(&self) -> i64;

    fn add_extra_data(&mut self, data: &ExtraData) -> Result<(), StorageError>;

    /// Finalise the current chunk. Closing an already closed handle is a no-op.
    fn close(&mut self) -> Result<(), StorageError>;
}

// ----------------------------------------------------------------------------
// Writer strategy selection
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriterFormat {
    #[default]
    ChunkedStore,
    RawImages,
    Ffmpeg,
}

impl WriterFormat {
    pub fn backend(&self, ffmpeg: &FfmpegOptions) -> Arc<dyn StorageBackend> {
        match self {
            WriterFormat::ChunkedStore => Arc::new(ChunkedStore),
            WriterFormat::RawImages => Arc::new(RawImageStore),
            WriterFormat::Ffmpeg => Arc::new(FfmpegStore::new(ffmpeg.clone())),
        }
    }
}

impl fmt::Display for WriterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterFormat::ChunkedStore => "chunked-store",
            WriterFormat::RawImages => "raw-images",
            WriterFormat::Ffmpeg => "ffmpeg",
        };
        f.write_str(name)
    }
}

impl FromStr for WriterFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chunked" | "chunked-store" => Ok(WriterFormat::ChunkedStore),
            "images" | "raw-images" => Ok(WriterFormat::RawImages),
            "ffmpeg" => Ok(WriterFormat::Ffmpeg),
            other => Err(format!(
                "unknown writer '{}' (expected chunked-store, raw-images or ffmpeg)",
                other
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------------

/// Frame counter deciding chunk rollover.
#[derive(Clone, Debug)]
pub(crate) struct ChunkCounter {
    chunk_size: u64,
    index: i64,
    in_chunk: u64,
}

impl ChunkCounter {
    pub(crate) fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            index: -1,
            in_chunk: 0,
        }
    }

    /// Chunk the next frame belongs to, without accounting it.
    pub(crate) fn next_index(&self) -> i64 {
        if self.opens_chunk() {
            self.index + 1
        } else {
            self.index
        }
    }

    fn opens_chunk(&self) -> bool {
        self.index < 0 || self.in_chunk >= self.chunk_size
    }

    /// Account one stored frame. Returns true when this frame opens a new chunk.
    pub(crate) fn advance(&mut self) -> bool {
        if self.opens_chunk() {
            self.index += 1;
            self.in_chunk = 1;
            true
        } else {
            self.in_chunk += 1;
            false
        }
    }

    pub(crate) fn index(&self) -> i64 {
        self.index
    }
}

pub(crate) fn chunk_stem(index: i64) -> String {
    format!("{:06}", index)
}

pub(crate) fn check_shape(expected: ImageShape, image: &Image) -> Result<(), StorageError> {
    if image.shape() != expected {
        return Err(StorageError::ShapeMismatch {
            expected,
            got: image.shape(),
        });
    }
    Ok(())
}

pub(crate) fn create_root(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))
}

/// Write `image` as PNG. Returns the file size in bytes.
pub fn save_png(path: &Path, image: &Image) -> Result<u64, StorageError> {
    let color = if image.channels() == 3 {
        image::ExtendedColorType::Rgb8
    } else {
        image::ExtendedColorType::L8
    };
    image::save_buffer(path, image.pixels(), image.width(), image.height(), color)
        .map_err(|e| StorageError::Encode(format!("{}: {}", path.display(), e)))?;
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| StorageError::io(path, e))
}

pub(crate) fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), StorageError> {
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::Encode(format!("{}: {}", path.display(), e)))?;
    std::fs::write(path, raw).map_err(|e| StorageError::io(path, e))
}

/// Append-only JSON-lines log of extra data, opened on first use.
pub(crate) struct ExtraDataLog {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl ExtraDataLog {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            path: root.join(EXTRA_DATA_FILE),
            out: None,
        }
    }

    pub(crate) fn append(&mut self, data: &ExtraData) -> Result<(), StorageError> {
        if self.out.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| StorageError::io(&self.path, e))?;
            self.out = Some(BufWriter::new(file));
        }
        let line = serde_json::to_string(data)
            .map_err(|e| StorageError::Encode(format!("extra data: {}", e)))?;
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "{}", line).map_err(|e| StorageError::io(&self.path, e))?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), StorageError> {
        if let Some(out) = self.out.as_mut() {
            out.flush().map_err(|e| StorageError::io(&self.path, e))?;
        }
        Ok(())
    }
}
