//! Region-of-interest recorder.
//!
//! Captures frames from one source, cuts every frame into regions of interest, and
//! records each region independently into chunked storage, without letting slow
//! storage stall capture.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource -> Dispatcher -> split_frame -> Recorder[i] (bounded buffer)
//!                                                 -> AsyncWriter[i] -> StorageHandle[i]
//! ```
//!
//! - One capture thread (the caller of `Dispatcher::run`).
//! - Per region: one writer thread owning the storage handle, and one supervisor thread
//!   evaluating stop conditions and polling the optional sensor.
//! - Frames within a region reach storage in capture order. A full buffer either evicts
//!   the oldest frame (`OverflowPolicy::DropOldest`, the default) or stalls capture
//!   (`OverflowPolicy::Block`); the policy is fixed for a session.
//! - Shutdown closes each region's buffer; the writer drains it, closes storage once, and
//!   the recorder reports `ExitCode::Clean` or `ExitCode::Unflushed`.
//!
//! # Module Structure
//!
//! - `frame`, `region`: pixel buffers, regions and the splitter
//! - `ingest`: frame sources (synthetic cameras, image directories)
//! - `storage`: chunked output strategies behind `StorageBackend`
//! - `writer`, `recorder`, `dispatcher`: the recording pipeline
//! - `sensor`: extra-data seam
//! - `config`: file and environment configuration
//! - `verify`: offline checks of a region output directory

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod logctx;
pub mod recorder;
pub mod region;
pub mod sensor;
pub mod storage;
pub mod verify;
pub mod writer;

pub use config::SessionConfig;
pub use dispatcher::{
    CapturePolicy, Dispatcher, DispatcherConfig, ProgressSink, RegionReport, SessionReport,
    StopHandle,
};
pub use error::{PipelineError, StorageError};
pub use frame::{Frame, Image, ImageShape};
pub use ingest::{open_source, FrameSource, ImageDirSource, SourceConfig, SyntheticSource};
pub use logctx::LogContext;
pub use recorder::{ExitCode, OverflowPolicy, Recorder, RecorderConfig, RecorderState};
pub use region::{region_output_path, split_frame, validate_regions, Region};
pub use sensor::{Sensor, StaticSensor};
pub use storage::{
    ChunkedStore, ExtraData, FfmpegOptions, FfmpegStore, MemoryStorage, RawImageStore,
    StorageBackend, StorageHandle, StoreSpec, WriterFormat,
};
pub use verify::{verify_region_dir, RegionDirReport};
pub use writer::{AsyncWriter, WriterConfig, WriterStats};
