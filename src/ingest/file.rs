//! Local image-directory frame source.
//!
//! `ImageDirSource` replays the PNG files of a local directory in lexical file-name order.
//! The first image fixes the resolution; a later image with another size is a capture
//! error. Timestamps advance by `1 / target_fps` per frame so a replay carries the
//! timing of the original capture rate, regardless of how fast it is read.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Image;

pub struct ImageDirSource {
    config: SourceConfig,
    files: Vec<PathBuf>,
    next_index: usize,
    width: u32,
    height: u32,
    last_frame_at: Option<Instant>,
    closed: bool,
}

impl ImageDirSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.url);
        if !dir.is_dir() {
            return Err(anyhow!("image source '{}' is not a directory", dir.display()));
        }
        let files = list_images(&dir)?;
        let first = files
            .first()
            .ok_or_else(|| anyhow!("image source '{}' contains no .png files", dir.display()))?;
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("failed to read {}", first.display()))?;

        log::info!(
            target: config.log.target(),
            "ImageDirSource: {} ({} images, {}x{})",
            dir.display(),
            files.len(),
            width,
            height
        );
        Ok(Self {
            config,
            files,
            next_index: 0,
            width,
            height,
            last_frame_at: None,
            closed: false,
        })
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.next_index as u64,
            url: self.config.url.clone(),
        }
    }

    fn load(&self, path: &Path) -> Result<Image> {
        let decoded =
            image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
        let (width, height, pixels) = match self.config.channels {
            3 => {
                let rgb = decoded.to_rgb8();
                (rgb.width(), rgb.height(), rgb.into_raw())
            }
            _ => {
                let gray = decoded.to_luma8();
                (gray.width(), gray.height(), gray.into_raw())
            }
        };
        if (width, height) != (self.width, self.height) {
            return Err(anyhow!(
                "{} is {}x{}, expected {}x{}",
                path.display(),
                width,
                height,
                self.width,
                self.height
            ));
        }
        Image::from_raw(width, height, self.channels(), pixels)
    }

    fn pace(&self) {
        if !self.config.paced || self.config.target_fps <= 0.0 {
            return;
        }
        let (Some(last), Ok(interval)) = (
            self.last_frame_at,
            Duration::try_from_secs_f64(1.0 / self.config.target_fps),
        ) else {
            return;
        };
        if let Some(remaining) = interval.checked_sub(last.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}

impl FrameSource for ImageDirSource {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn channels(&self) -> u8 {
        if self.config.channels == 3 {
            3
        } else {
            1
        }
    }

    fn next_frame(&mut self) -> Result<Option<(f64, Image)>> {
        if self.closed || self.next_index >= self.files.len() {
            return Ok(None);
        }
        if let Some(max) = self.config.max_frames {
            if self.next_index as u64 >= max {
                return Ok(None);
            }
        }
        self.pace();

        let path = self.files[self.next_index].clone();
        let image = self.load(&path)?;
        let fps = if self.config.target_fps > 0.0 {
            self.config.target_fps
        } else {
            1.0
        };
        let timestamp = self.next_index as f64 / fps;
        self.next_index += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some((timestamp, image)))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        let is_png = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("png"))
            .unwrap_or(false);
        if path.is_file() && is_png {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32, value: u8) {
        let data = vec![value; (width * height) as usize];
        image::save_buffer(
            dir.join(name),
            &data,
            width,
            height,
            image::ExtendedColorType::L8,
        )
        .expect("write png");
    }

    fn config(dir: &Path) -> SourceConfig {
        SourceConfig {
            url: dir.display().to_string(),
            channels: 1,
            target_fps: 10.0,
            paced: false,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn replays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 6, 4, 2);
        write_png(dir.path(), "a.png", 6, 4, 1);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageDirSource::new(config(dir.path())).unwrap();
        assert_eq!(source.resolution(), (6, 4));
        let (t0, first) = source.next_frame().unwrap().unwrap();
        let (t1, second) = source.next_frame().unwrap().unwrap();
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(first.pixel(0, 0), &[1]);
        assert_eq!(second.pixel(0, 0), &[2]);
        assert_eq!(t0, 0.0);
        assert!((t1 - 0.1).abs() < 1e-9);
    }

    #[test]
    fn size_change_is_a_capture_error() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "0.png", 6, 4, 0);
        write_png(dir.path(), "1.png", 5, 4, 0);
        let mut source = ImageDirSource::new(config(dir.path())).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::new(config(dir.path())).is_err());
    }
}
