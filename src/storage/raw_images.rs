//! One PNG per frame. Chunk `k` is the directory `{k:06}/`, frames inside are named by
//! zero-padded capture sequence.

use std::path::PathBuf;

use super::{
    check_shape, chunk_stem, create_root, save_png, write_json, ChunkCounter, ExtraData,
    ExtraDataLog, StorageBackend, StorageHandle, StoreSpec, METADATA_FILE,
};
use crate::error::StorageError;
use crate::frame::{Image, ImageShape};

#[derive(Clone, Copy, Debug, Default)]
pub struct RawImageStore;

impl StorageBackend for RawImageStore {
    fn name(&self) -> &'static str {
        "raw-images"
    }

    fn open(&self, spec: &StoreSpec) -> Result<Box<dyn StorageHandle>, StorageError> {
        create_root(&spec.path)?;
        write_json(
            &spec.path.join(METADATA_FILE),
            &serde_json::json!({
                "format": self.name(),
                "framerate": spec.framerate,
                "chunk_size": spec.chunk_size,
                "shape": spec.shape,
            }),
        )?;
        Ok(Box::new(RawImageHandle {
            root: spec.path.clone(),
            shape: spec.shape,
            counter: ChunkCounter::new(spec.chunk_size),
            extra: ExtraDataLog::new(&spec.path),
            closed: false,
        }))
    }
}

struct RawImageHandle {
    root: PathBuf,
    shape: ImageShape,
    counter: ChunkCounter,
    extra: ExtraDataLog,
    closed: bool,
}

impl StorageHandle for RawImageHandle {
    fn add_image(
        &mut self,
        image: &Image,
        sequence: u64,
        _timestamp: f64,
    ) -> Result<usize, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        check_shape(self.shape, image)?;
        let chunk_dir = self.root.join(chunk_stem(self.counter.next_index()));
        create_root(&chunk_dir)?;
        let size = save_png(&chunk_dir.join(format!("{:010}.png", sequence)), image)?;
        self.counter.advance();
        Ok(size as usize)
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
        self.extra.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logctx::LogContext;

    #[test]
    fn one_directory_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let spec = StoreSpec {
            path: dir.path().join("roi"),
            framerate: 10.0,
            shape: ImageShape::new(3, 3, 3),
            chunk_size: 2,
            log: LogContext::for_region(0),
        };
        let mut handle = RawImageStore.open(&spec).unwrap();
        for seq in 10..15u64 {
            let size = handle
                .add_image(&Image::filled(3, 3, 3, 200), seq, 0.0)
                .unwrap();
            assert!(size > 0);
        }
        handle.close().unwrap();
        handle.close().unwrap();

        assert_eq!(handle.current_chunk_index(), 2);
        assert!(spec.path.join("000000/0000000010.png").is_file());
        assert!(spec.path.join("000001/0000000013.png").is_file());
        assert!(spec.path.join("000002/0000000014.png").is_file());
        let decoded = image::open(spec.path.join("000002/0000000014.png")).unwrap();
        assert_eq!(decoded.to_rgb8().get_pixel(1, 1).0, [200, 200, 200]);
    }
}
