//! Error types for the capture/record pipeline.
//!
//! - `PipelineError`: configuration, capture and lifecycle failures surfaced to callers.
//! - `StorageError`: per-handle backend failures. A failed `add_image` is a write error:
//!   it is logged by the writer and recording continues with the next frame.
//!
//! An incomplete shutdown is not an error; it is reported as `ExitCode::Unflushed`.

use std::path::PathBuf;

use thiserror::Error;

use crate::frame::ImageShape;
use crate::region::Region;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("region #{index} {region} exceeds source frame {frame_width}x{frame_height}")]
    InvalidRegion {
        index: usize,
        region: Region,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("capture failed after {attempts} attempt(s): {message}")]
    Capture { attempts: u32, message: String },

    #[error("roi {region}: storage error: {source}")]
    Storage {
        region: usize,
        #[source]
        source: StorageError,
    },

    #[error("roi {region}: failed to spawn {role} thread: {source}")]
    Spawn {
        region: usize,
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("roi {region}: cannot {action} while {state}")]
    State {
        region: usize,
        action: &'static str,
        state: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("frame shape {got} does not match store shape {expected}")]
    ShapeMismatch {
        expected: ImageShape,
        got: ImageShape,
    },

    #[error("storage handle is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
