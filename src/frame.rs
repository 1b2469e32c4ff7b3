//! Frame and pixel buffer types.
//!
//! - `Image`: owned 8-bit pixel buffer, row-major, 1 (gray) or 3 (RGB) interleaved channels.
//! - `Frame`: one region's image tagged with the capture timestamp and sequence number.
//!
//! Neither type exposes a mutating API. Once a `Frame` is queued it is moved to exactly
//! one writer and dropped after being written or discarded.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image geometry. `dims()` follows the (rows, cols) convention of the output stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
}

impl ImageShape {
    pub fn new(width: u32, height: u32, channels: u8) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// (rows, cols)
    pub fn dims(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_color(&self) -> bool {
        self.channels == 3
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.channels == 1 {
            write!(f, "({}, {})", self.height, self.width)
        } else {
            write!(f, "({}, {}, {})", self.height, self.width, self.channels)
        }
    }
}

// ----------------------------------------------------------------------------
// Image
// ----------------------------------------------------------------------------

/// Owned pixel buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    shape: ImageShape,
    data: Vec<u8>,
}

impl Image {
    /// Wrap raw interleaved bytes. Fails if the byte count does not match the geometry.
    pub fn from_raw(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let shape = ImageShape::new(width, height, channels);
        if data.len() != shape.byte_len() {
            return Err(anyhow!(
                "pixel buffer has {} bytes, expected {} for shape {}",
                data.len(),
                shape.byte_len(),
                shape
            ));
        }
        Ok(Self { shape, data })
    }

    /// Uniform image. Handy for tests and synthetic sources.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let shape = ImageShape::new(width, height, channels);
        Self {
            shape,
            data: vec![value; shape.byte_len()],
        }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn channels(&self) -> u8 {
        self.shape.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Channel values of the pixel at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.shape.channels as usize;
        let start = (y as usize * self.shape.width as usize + x as usize) * c;
        &self.data[start..start + c]
    }

    /// Copy out the rectangle at (`x`, `y`) of size `width` x `height`.
    ///
    /// Callers validate bounds first (see `region::split_frame`).
    pub(crate) fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Image {
        let c = self.shape.channels as usize;
        let src_stride = self.shape.width as usize * c;
        let row_len = width as usize * c;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in y..y + height {
            let start = row as usize * src_stride + x as usize * c;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Image {
            shape: ImageShape::new(width, height, self.shape.channels),
            data,
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured (sub-)image as it travels through a region queue.
#[derive(Debug)]
pub struct Frame {
    timestamp: f64,
    sequence: u64,
    image: Image,
}

impl Frame {
    pub fn new(timestamp: f64, sequence: u64, image: Image) -> Self {
        Self {
            timestamp,
            sequence,
            image,
        }
    }

    /// Seconds since capture start.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Capture sequence number, shared by all regions cut from the same capture.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn into_image(self) -> Image {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> Image {
        let data = (0..width * height).map(|i| (i % 256) as u8).collect();
        Image::from_raw(width, height, 1, data).expect("ramp image")
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        let err = Image::from_raw(4, 4, 1, vec![0; 15]).unwrap_err();
        assert!(err.to_string().contains("expected 16"));
    }

    #[test]
    fn from_raw_rejects_unsupported_channels() {
        assert!(Image::from_raw(2, 2, 4, vec![0; 16]).is_err());
    }

    #[test]
    fn crop_copies_the_requested_rows() {
        let img = ramp(10, 5);
        let sub = img.crop(2, 1, 3, 2);
        assert_eq!(sub.shape().dims(), (2, 3));
        assert_eq!(sub.pixels(), &[12, 13, 14, 22, 23, 24]);
    }

    #[test]
    fn crop_keeps_color_channels_interleaved() {
        let data: Vec<u8> = (0..(4 * 2 * 3)).map(|v| v as u8).collect();
        let img = Image::from_raw(4, 2, 3, data).unwrap();
        let sub = img.crop(1, 1, 2, 1);
        assert_eq!(sub.shape(), ImageShape::new(2, 1, 3));
        assert_eq!(sub.pixels(), &[15, 16, 17, 18, 19, 20]);
        assert_eq!(sub.pixel(1, 0), &[18, 19, 20]);
    }

    #[test]
    fn shape_display_uses_rows_then_cols() {
        assert_eq!(ImageShape::new(100, 50, 1).to_string(), "(50, 100)");
        assert_eq!(ImageShape::new(100, 50, 3).to_string(), "(50, 100, 3)");
    }
}
