//! Chunked raw store.
//!
//! Layout of a region directory:
//! - `metadata.json`: shape, frame rate, chunk size
//! - `{chunk:06}.raw`: concatenated frame bytes of the chunk
//! - `{chunk:06}.index.json`: per-frame sequence, timestamp and byte offset,
//!   written when the chunk is finalised
//! - `extra_data.jsonl`: extra data, one JSON object per line

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    check_shape, chunk_stem, create_root, write_json, ChunkCounter, ExtraData, ExtraDataLog,
    StorageBackend, StorageHandle, StoreSpec, METADATA_FILE,
};
use crate::error::StorageError;
use crate::frame::{Image, ImageShape};

pub const CHUNK_EXTENSION: &str = "raw";
pub const INDEX_SUFFIX: &str = ".index.json";

/// One frame's entry in a chunk index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub sequence: u64,
    pub timestamp: f64,
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkedStore;

impl StorageBackend for ChunkedStore {
    fn name(&self) -> &'static str {
        "chunked-store"
    }

    fn open(&self, spec: &StoreSpec) -> Result<Box<dyn StorageHandle>, StorageError> {
        create_root(&spec.path)?;
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        write_json(
            &spec.path.join(METADATA_FILE),
            &serde_json::json!({
                "format": self.name(),
                "framerate": spec.framerate,
                "chunk_size": spec.chunk_size,
                "shape": spec.shape,
                "created_epoch_s": created,
            }),
        )?;
        Ok(Box::new(ChunkedHandle {
            root: spec.path.clone(),
            shape: spec.shape,
            counter: ChunkCounter::new(spec.chunk_size),
            open: None,
            extra: ExtraDataLog::new(&spec.path),
            closed: false,
        }))
    }
}

/// Raw file and frame index of the chunk being written.
struct OpenChunk {
    index: i64,
    raw_path: PathBuf,
    file: File,
    entries: Vec<ChunkIndexEntry>,
    offset: u64,
}

impl OpenChunk {
    fn create(root: &Path, index: i64) -> Result<Self, StorageError> {
        let raw_path = root.join(format!("{}.{}", chunk_stem(index), CHUNK_EXTENSION));
        let file = File::create(&raw_path).map_err(|e| StorageError::io(&raw_path, e))?;
        Ok(Self {
            index,
            raw_path,
            file,
            entries: Vec::new(),
            offset: 0,
        })
    }

    fn append(
        &mut self,
        pixels: &[u8],
        sequence: u64,
        timestamp: f64,
    ) -> Result<(), StorageError> {
        if let Err(err) = self.file.write_all(pixels) {
            // Cut the partial frame so later offsets stay exact.
            let rewound = self
                .file
                .set_len(self.offset)
                .and_then(|()| self.file.seek(SeekFrom::Start(self.offset)));
            if rewound.is_err() {
                if let Ok(end) = self.file.stream_position() {
                    self.offset = end;
                }
            }
            return Err(StorageError::io(&self.raw_path, err));
        }
        self.entries.push(ChunkIndexEntry {
            sequence,
            timestamp,
            offset: self.offset,
            len: pixels.len() as u64,
        });
        self.offset += pixels.len() as u64;
        Ok(())
    }

    fn finish(mut self, root: &Path) -> Result<(), StorageError> {
        self.file
            .flush()
            .map_err(|e| StorageError::io(&self.raw_path, e))?;
        let entries = serde_json::to_value(&self.entries)
            .map_err(|e| StorageError::Encode(format!("chunk index: {}", e)))?;
        write_json(
            &root.join(format!("{}{}", chunk_stem(self.index), INDEX_SUFFIX)),
            &entries,
        )
    }
}

struct ChunkedHandle {
    root: PathBuf,
    shape: ImageShape,
    counter: ChunkCounter,
    open: Option<OpenChunk>,
    extra: ExtraDataLog,
    closed: bool,
}

impl ChunkedHandle {
    /// Make sure the chunk the next frame belongs to is open.
    ///
    /// A chunk whose finish failed is dropped, so the following frame starts the new
    /// chunk instead of failing against a missing file.
    fn chunk_for_next_frame(&mut self) -> Result<&mut OpenChunk, StorageError> {
        let target = self.counter.next_index();
        if self.open.as_ref().map(|c| c.index) != Some(target) {
            if let Some(previous) = self.open.take() {
                previous.finish(&self.root)?;
            }
            self.open = Some(OpenChunk::create(&self.root, target)?);
        }
        self.open
            .as_mut()
            .ok_or_else(|| StorageError::Backend(format!("chunk {} is not open", target)))
    }
}

impl StorageHandle for ChunkedHandle {
    fn add_image(
        &mut self,
        image: &Image,
        sequence: u64,
        timestamp: f64,
    ) -> Result<usize, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        check_shape(self.shape, image)?;

        let pixels = image.pixels();
        self.chunk_for_next_frame()?.append(pixels, sequence, timestamp)?;
        self.counter.advance();
        Ok(pixels.len())
    }

    fn current_chunk_index(&self) -> i64 {
        self.counter.index()
    }

    fn add_extra_data(&mut self, data: &ExtraData) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.extra.append(data)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let finished = match self.open.take() {
            Some(chunk) => chunk.finish(&self.root),
            None => Ok(()),
        };
        self.extra.flush()?;
        finished
    }
}
