//! Face normalisation: crop, grayscale, area resize, histogram equalisation.

use crate::types::BoundingBox;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::equalize_histogram;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("face region {region:?} is empty after clipping to {width}x{height}")]
    InvalidRegion {
        region: BoundingBox,
        width: u32,
        height: u32,
    },
}

/// A face normalised to the canonical size, single channel, equalised.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFace {
    image: GrayImage,
}

impl CanonicalFace {
    /// Wrap an image that is already canonical (e.g. a stored training sample).
    pub fn from_preprocessed(image: GrayImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Turns a region of an arbitrary image into a [`CanonicalFace`].
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    width: u32,
    height: u32,
}

impl Preprocessor {
    pub fn new(canonical_size: [u32; 2]) -> Self {
        Self {
            width: canonical_size[0],
            height: canonical_size[1],
        }
    }

    pub fn canonical_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Normalise `region` of a color or grayscale image.
    pub fn normalize(&self, image: &DynamicImage, region: &BoundingBox) -> Result<CanonicalFace, PreprocessError> {
        let clipped = clip(region, image.width(), image.height())?;
        let crop = image
            .crop_imm(clipped.x, clipped.y, clipped.width, clipped.height)
            .to_luma8();
        Ok(self.finish(&crop))
    }

    /// Same as [`normalize`](Self::normalize) for an image already in grayscale.
    pub fn normalize_gray(&self, gray: &GrayImage, region: &BoundingBox) -> Result<CanonicalFace, PreprocessError> {
        let clipped = clip(region, gray.width(), gray.height())?;
        let crop = image::imageops::crop_imm(gray, clipped.x, clipped.y, clipped.width, clipped.height).to_image();
        Ok(self.finish(&crop))
    }

    fn finish(&self, crop: &GrayImage) -> CanonicalFace {
        let resized = resize_area(crop, self.width, self.height);
        CanonicalFace {
            image: equalize_histogram(&resized),
        }
    }
}

fn clip(region: &BoundingBox, width: u32, height: u32) -> Result<BoundingBox, PreprocessError> {
    region.clip_to(width, height).ok_or(PreprocessError::InvalidRegion {
        region: *region,
        width,
        height,
    })
}

/// Source pixel contributions `(index, weight)` for each output pixel on one axis.
fn area_weights(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|o| {
            let start = o as f64 * scale;
            let end = (o + 1) as f64 * scale;
            let first = start.floor() as u32;
            let last = (end.ceil() as u32).min(src);
            (first..last)
                .filter_map(|i| {
                    let lo = start.max(i as f64);
                    let hi = end.min((i + 1) as f64);
                    (hi > lo).then(|| (i, (hi - lo) as f32))
                })
                .collect()
        })
        .collect()
}

/// Area-averaging resize: every output pixel is the coverage-weighted mean of
/// the source pixels under it.
pub fn resize_area(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (sw, sh) = src.dimensions();
    if (sw, sh) == (width, height) {
        return src.clone();
    }
    let wx = area_weights(sw, width);
    let wy = area_weights(sh, height);

    GrayImage::from_fn(width, height, |ox, oy| {
        let mut acc = 0.0f32;
        let mut total = 0.0f32;
        for &(sy, fy) in &wy[oy as usize] {
            for &(sx, fx) in &wx[ox as usize] {
                let w = fx * fy;
                acc += src.get_pixel(sx, sy)[0] as f32 * w;
                total += w;
            }
        }
        let value = if total > 0.0 { acc / total } else { 0.0 };
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}
