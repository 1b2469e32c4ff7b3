//! Encoded video chunks through an external `ffmpeg` process.
//!
//! Each chunk is one `ffmpeg` child reading raw frames (`gray` or `rgb24`) on stdin and
//! writing `{chunk:06}.<extension>`. Finishing a chunk closes stdin and waits for the
//! child to exit.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use super::{
    check_shape, chunk_stem, create_root, write_json, ChunkCounter, ExtraData, ExtraDataLog,
    StorageBackend, StorageHandle, StoreSpec, METADATA_FILE,
};
use crate::error::StorageError;
use crate::frame::{Image, ImageShape};
use crate::logctx::LogContext;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegOptions {
    /// Executable name or path.
    pub binary: String,
    pub codec: String,
    /// Container extension of chunk files.
    pub extension: String,
    /// Extra output arguments inserted before the output path.
    pub extra_args: Vec<String>,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            codec: "mjpeg".to_string(),
            extension: "avi".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Arguments for one chunk encoder reading raw frames of `shape` on stdin.
pub fn encoder_args(
    options: &FfmpegOptions,
    shape: ImageShape,
    framerate: f64,
    output: &Path,
) -> Vec<String> {
    let pix_fmt = if shape.is_color() { "rgb24" } else { "gray" };
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        pix_fmt.into(),
        "-s".into(),
        format!("{}x{}", shape.width, shape.height),
        "-r".into(),
        format!("{}", framerate),
        "-i".into(),
        "-".into(),
        "-an".into(),
        "-c:v".into(),
        options.codec.clone(),
    ];
    args.extend(options.extra_args.iter().cloned());
    args.push(output.display().to_string());
    args
}

#[derive(Clone, Debug, Default)]
pub struct FfmpegStore {
    options: FfmpegOptions,
}

impl FfmpegStore {
    pub fn new(options: FfmpegOptions) -> Self {
        Self { options }
    }

    fn check_binary(&self) -> Result<(), StorageError> {
        let status = Command::new(&self.options.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                StorageError::Backend(format!("cannot run '{}': {}", self.options.binary, e))
            })?;
        if !status.success() {
            return Err(StorageError::Backend(format!(
                "'{} -version' exited with {}",
                self.options.binary, status
            )));
        }
        Ok(())
    }
}

impl StorageBackend for FfmpegStore {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, spec: &StoreSpec) -> Result<Box<dyn StorageHandle>, StorageError> {
        self.check_binary()?;
        create_root(&spec.path)?;
        write_json(
            &spec.path.join(METADATA_FILE),
            &serde_json::json!({
                "format": self.name(),
                "codec": self.options.codec,
                "extension": self.options.extension,
                "framerate": spec.framerate,
                "chunk_size": spec.chunk_size,
                "shape": spec.shape,
            }),
        )?;
        Ok(Box::new(FfmpegHandle {
            options: self.options.clone(),
            root: spec.path.clone(),
            shape: spec.shape,
            framerate: spec.framerate,
            counter: ChunkCounter::new(spec.chunk_size),
            encoder: None,
            extra: ExtraDataLog::new(&spec.path),
            closed: false,
            log: spec.log.clone(),
        }))
    }
}

struct Encoder {
    chunk: i64,
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
}

impl Encoder {
    fn finish(mut self) -> Result<(), StorageError> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| StorageError::io(&self.output, e))?;
        if !status.success() {
            return Err(StorageError::Encode(format!(
                "ffmpeg exited with {} while writing {}",
                status,
                self.output.display()
            )));
        }
        Ok(())
    }
}

struct FfmpegHandle {
    options: FfmpegOptions,
    root: PathBuf,
    shape: ImageShape,
    framerate: f64,
    counter: ChunkCounter,
    encoder: Option<Encoder>,
    extra: ExtraDataLog,
    closed: bool,
    log: LogContext,
}

impl FfmpegHandle {
    fn spawn_encoder(&self, chunk: i64) -> Result<Encoder, StorageError> {
        let output = self
            .root
            .join(format!("{}.{}", chunk_stem(chunk), self.options.extension));
        let mut child = Command::new(&self.options.binary)
            .args(encoder_args(&self.options, self.shape, self.framerate, &output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                StorageError::Backend(format!("failed to spawn '{}': {}", self.options.binary, e))
            })?;
        let stdin = child.stdin.take();
        log::debug!(
            target: self.log.target(),
            "ffmpeg: started encoder for {}",
            output.display()
        );
        Ok(Encoder {
            chunk,
            child,
            stdin,
            output,
        })
    }
}

impl StorageHandle for FfmpegHandle {
    fn add_image(
        &mut self,
        image: &Image,
        _sequence: u64,
        _timestamp: f64,
    ) -> Result<usize, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        check_shape(self.shape, image)?;
        let target = self.counter.next_index();
        if self.encoder.as_ref().map(|e| e.chunk) != Some(target) {
            // A failed finish leaves no encoder behind, so the next frame starts `target`.
            if let Some(previous) = self.encoder.take() {
                previous.finish()?;
            }
            self.encoder = Some(self.spawn_encoder(target)?);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| StorageError::Backend("no running encoder".to_string()))?;
        let stdin = encoder
            .stdin
            .as_mut()
            .ok_or_else(|| StorageError::Backend("encoder stdin is closed".to_string()))?;
        stdin
            .write_all(image.pixels())
            .map_err(|e| StorageError::io(&encoder.output, e))?;
        self.counter.advance();
        Ok(image.byte_len())
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
        let finished = match self.encoder.take() {
            Some(encoder) => encoder.finish(),
            None => Ok(()),
        };
        self.extra.flush()?;
        finished
    }
}
