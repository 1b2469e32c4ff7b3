//! Synthetic emulator cameras.
//!
//! `SyntheticSource` stands in for a camera driver in tests and dry runs:
//! - `stub://random`: fresh noise every frame
//! - `stub://deterministic`: one noise frame, repeated
//! - `stub://gradient`: a diagonal ramp that shifts by one level per frame
//!
//! With `paced` set the source sleeps so frames arrive at `target_fps`.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Image;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    Random,
    Deterministic,
    Gradient,
}

impl Pattern {
    fn from_url(url: &str) -> Result<Self> {
        match url.strip_prefix("stub://") {
            Some("random") | Some("") => Ok(Pattern::Random),
            Some("deterministic") => Ok(Pattern::Deterministic),
            Some("gradient") => Ok(Pattern::Gradient),
            _ => Err(anyhow!(
                "unknown synthetic source '{}' (expected stub://random, stub://deterministic or stub://gradient)",
                url
            )),
        }
    }
}

pub struct SyntheticSource {
    config: SourceConfig,
    pattern: Pattern,
    frame_count: u64,
    started_at: Instant,
    last_frame_at: Option<Instant>,
    fixed: Option<Vec<u8>>,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let pattern = Pattern::from_url(&config.url)?;
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source needs a non-zero resolution"));
        }
        if config.channels != 1 && config.channels != 3 {
            return Err(anyhow!("unsupported channel count {}", config.channels));
        }
        log::info!(
            target: config.log.target(),
            "SyntheticSource: {} {}x{} @ {} fps",
            config.url,
            config.width,
            config.height,
            config.target_fps
        );
        Ok(Self {
            config,
            pattern,
            frame_count: 0,
            started_at: Instant::now(),
            last_frame_at: None,
            fixed: None,
            closed: false,
        })
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    fn pace(&self) {
        if !self.config.paced || self.config.target_fps <= 0.0 {
            return;
        }
        let Some(last) = self.last_frame_at else {
            return;
        };
        let Ok(interval) = Duration::try_from_secs_f64(1.0 / self.config.target_fps) else {
            return;
        };
        if let Some(remaining) = interval.checked_sub(last.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    fn timestamp(&self) -> Result<f64> {
        if self.config.use_wall_clock {
            Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
        } else {
            Ok(self.started_at.elapsed().as_secs_f64())
        }
    }

    fn byte_len(&self) -> usize {
        self.config.width as usize * self.config.height as usize * self.config.channels as usize
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        match self.pattern {
            Pattern::Random => {
                let mut pixels = vec![0u8; self.byte_len()];
                rand::thread_rng().fill_bytes(&mut pixels);
                pixels
            }
            Pattern::Deterministic => {
                let len = self.byte_len();
                self.fixed
                    .get_or_insert_with(|| {
                        let mut pixels = vec![0u8; len];
                        rand::thread_rng().fill_bytes(&mut pixels);
                        pixels
                    })
                    .clone()
            }
            Pattern::Gradient => {
                let width = self.config.width as u64;
                let channels = self.config.channels as u64;
                let mut pixels = vec![0u8; self.byte_len()];
                for (i, pixel) in pixels.iter_mut().enumerate() {
                    let p = i as u64 / channels;
                    let (x, y) = (p % width, p / width);
                    *pixel = ((x + y + self.frame_count) % 256) as u8;
                }
                pixels
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn resolution(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn channels(&self) -> u8 {
        self.config.channels
    }

    fn next_frame(&mut self) -> Result<Option<(f64, Image)>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                return Ok(None);
            }
        }
        self.pace();

        let timestamp = self.timestamp()?;
        let pixels = self.generate_pixels();
        let image = Image::from_raw(
            self.config.width,
            self.config.height,
            self.config.channels,
            pixels,
        )?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some((timestamp, image)))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            log::debug!(
                target: self.config.log.target(),
                "SyntheticSource: closing {} after {} frames",
                self.config.url,
                self.frame_count
            );
            self.closed = true;
        }
        Ok(())
    }
}
