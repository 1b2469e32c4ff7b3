//! Regions of interest and the frame splitter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::PipelineError;
use crate::frame::Image;

/// Rectangle in source pixel coordinates. Fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The implicit region covering a whole `width` x `height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= frame_width && b <= frame_height)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Parses `x,y,width,height`.
impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid region '{}': {}", s, e))?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(Region::new(*x, *y, *w, *h)),
            _ => Err(format!(
                "invalid region '{}': expected x,y,width,height",
                s
            )),
        }
    }
}

/// Check a session's region list: at least one region, no zero-area rectangles and no
/// duplicated rectangles. Partial overlap between regions is allowed.
pub fn validate_regions(regions: &[Region]) -> Result<(), PipelineError> {
    if regions.is_empty() {
        return Err(PipelineError::Configuration(
            "at least one region must be configured".to_string(),
        ));
    }
    for (i, region) in regions.iter().enumerate() {
        if region.area() == 0 {
            return Err(PipelineError::Configuration(format!(
                "region #{} {} has zero area",
                i, region
            )));
        }
        if let Some(j) = regions[..i].iter().position(|other| other == region) {
            return Err(PipelineError::Configuration(format!(
                "region #{} {} duplicates region #{}",
                i, region, j
            )));
        }
    }
    Ok(())
}

/// Cut one sub-image per region out of `image`, in region order.
///
/// An empty region list yields the whole frame as the single implicit region.
pub fn split_frame(image: &Image, regions: &[Region]) -> Result<Vec<Image>, PipelineError> {
    if regions.is_empty() {
        return Ok(vec![image.clone()]);
    }
    if let Some((index, region)) = regions
        .iter()
        .enumerate()
        .find(|(_, r)| !r.fits_within(image.width(), image.height()))
    {
        return Err(PipelineError::InvalidRegion {
            index,
            region: *region,
            frame_width: image.width(),
            frame_height: image.height(),
        });
    }
    Ok(regions
        .iter()
        .map(|r| image.crop(r.x, r.y, r.width, r.height))
        .collect())
}

/// Output location of region `idx`: `<base>_ROI_<idx>` next to `base`.
pub fn region_output_path(base: &Path, idx: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    base.with_file_name(format!("{}_ROI_{}", name, idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(width: u32, height: u32) -> Image {
        let data = (0..width * height).map(|i| (i % 251) as u8).collect();
        Image::from_raw(width, height, 1, data).unwrap()
    }

    #[test]
    fn split_returns_one_image_per_region_in_order() {
        let frame = numbered(300, 300);
        let regions = [Region::new(0, 0, 100, 50), Region::new(100, 100, 200, 200)];
        let parts = split_frame(&frame, &regions).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].shape().dims(), (50, 100));
        assert_eq!(parts[1].shape().dims(), (200, 200));
        assert_eq!(parts[1].pixel(0, 0), frame.pixel(100, 100));
        assert_eq!(parts[1].pixel(199, 199), frame.pixel(299, 299));
    }

    #[test]
    fn empty_region_list_yields_whole_frame() {
        let frame = numbered(64, 48);
        let parts = split_frame(&frame, &[]).unwrap();
        assert_eq!(parts, vec![frame]);
    }

    #[test]
    fn out_of_bounds_region_is_rejected() {
        let frame = numbered(100, 100);
        let regions = [Region::new(0, 0, 10, 10), Region::new(95, 0, 10, 10)];
        match split_frame(&frame, &regions) {
            Err(PipelineError::InvalidRegion { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected InvalidRegion, got {:?}", other),
        }
    }

    #[test]
    fn overflowing_coordinates_do_not_fit() {
        assert!(!Region::new(u32::MAX, 0, 2, 2).fits_within(100, 100));
        assert!(Region::new(98, 98, 2, 2).fits_within(100, 100));
    }

    #[test]
    fn validate_rejects_empty_zero_area_and_duplicates() {
        assert!(validate_regions(&[]).is_err());
        assert!(validate_regions(&[Region::new(0, 0, 0, 10)]).is_err());
        let dup = [Region::new(0, 0, 10, 10), Region::new(0, 0, 10, 10)];
        assert!(validate_regions(&dup).is_err());
        let overlap = [Region::new(0, 0, 10, 10), Region::new(5, 5, 10, 10)];
        assert!(validate_regions(&overlap).is_ok());
    }

    #[test]
    fn parses_region_from_csv() {
        let r: Region = "10, 20,30,40".parse().unwrap();
        assert_eq!(r, Region::new(10, 20, 30, 40));
        assert!("1,2,3".parse::<Region>().is_err());
        assert!("a,b,c,d".parse::<Region>().is_err());
    }

    #[test]
    fn output_path_gets_region_suffix() {
        let base = Path::new("/data/videos/2024-01-01_10-00-00");
        assert_eq!(
            region_output_path(base, 1),
            PathBuf::from("/data/videos/2024-01-01_10-00-00_ROI_1")
        );
    }
}
