//! Checks applied to photos before they reach the engine.

use facelookup_core::detector::{detect_in_image, select_faces};
use facelookup_core::{BoundingBox, EngineConfig, FaceDetector};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::path::{Path, PathBuf};
use thiserror::Error;

const ACCEPTED_FORMATS: [ImageFormat; 4] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Bmp, ImageFormat::Gif];

#[derive(Error, Debug)]
pub enum ImageLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported image format (accepted: jpeg, png, bmp, gif)")]
    UnsupportedFormat,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image is {width}x{height}, limit is {max_width}x{max_height}")]
    DimensionsTooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    #[error("image is {width}x{height}, enrollment photos must be at least {min_width}x{min_height}")]
    DimensionsTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    #[error("no face found in image")]
    NoFace,
    #[error("face detection failed: {0}")]
    Detection(#[from] facelookup_core::detector::DetectorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: u64,
    pub max_dimensions: [u32; 2],
    pub min_enrollment: [u32; 2],
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_dimensions: [4000, 4000],
            min_enrollment: [100, 100],
        }
    }
}

/// Read and decode a photo, rejecting files the engine should never see.
pub fn load_image(path: &Path, limits: &ImageLimits) -> Result<DynamicImage, ImageLoadError> {
    let io_err = |source| ImageLoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > limits.max_bytes {
        return Err(ImageLoadError::TooLarge {
            size,
            limit: limits.max_bytes,
        });
    }
    let bytes = std::fs::read(path).map_err(io_err)?;
    decode(&bytes, limits)
}

/// Same checks as [`load_image`] for bytes already in memory.
pub fn decode(bytes: &[u8], limits: &ImageLimits) -> Result<DynamicImage, ImageLoadError> {
    if bytes.len() as u64 > limits.max_bytes {
        return Err(ImageLoadError::TooLarge {
            size: bytes.len() as u64,
            limit: limits.max_bytes,
        });
    }
    let format = image::guess_format(bytes).map_err(|_| ImageLoadError::UnsupportedFormat)?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(ImageLoadError::UnsupportedFormat);
    }
    let image = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = image.dimensions();
    let [max_width, max_height] = limits.max_dimensions;
    if width > max_width || height > max_height {
        return Err(ImageLoadError::DimensionsTooLarge {
            width,
            height,
            max_width,
            max_height,
        });
    }
    tracing::debug!(?format, width, height, "image decoded");
    Ok(image)
}

/// Confirm a photo is usable for enrollment and return the face it would
/// contribute. Several faces are accepted; the largest one is used.
pub fn check_enrollment_image(
    image: &DynamicImage,
    detector: &dyn FaceDetector,
    config: &EngineConfig,
    limits: &ImageLimits,
) -> Result<BoundingBox, ImageLoadError> {
    let (width, height) = image.dimensions();
    let [min_width, min_height] = limits.min_enrollment;
    if width < min_width || height < min_height {
        return Err(ImageLoadError::DimensionsTooSmall {
            width,
            height,
            min_width,
            min_height,
        });
    }

    let boxes = detect_in_image(detector, image, config.pipeline.max_image_size)?;
    let boxes = select_faces(boxes, config.detector.min_size, usize::MAX);
    let Some(face) = boxes.first().copied() else {
        return Err(ImageLoadError::NoFace);
    };
    if boxes.len() > 1 {
        tracing::warn!(faces = boxes.len(), "multiple faces in enrollment photo, the largest will be used");
    }
    Ok(face)
}
