//! Face detection: the detector seam, the Haar cascade backend, and the
//! size/count policy applied to any backend's output.

use crate::cascade::{HaarCascade, ScanParams};
use crate::config::DetectorConfig;
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0} (convert a frontal-face cascade to JSON and place it in the model dir)")]
    CascadeNotFound(String),
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
    #[error("cascade json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Locates candidate face regions in a single-channel image.
///
/// Implementations return an empty list for images without faces. Callers
/// apply [`select_faces`] afterwards, so backends need not enforce the size
/// floor or the face cap themselves.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// Short backend name reported in results and status.
    fn name(&self) -> &'static str;
}

/// Multi-scale Haar cascade detector.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: ScanParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, config: &DetectorConfig) -> Self {
        Self {
            cascade,
            params: ScanParams {
                scale_factor: config.scale_factor,
                min_neighbors: config.min_neighbors,
                min_size: (config.min_size[0], config.min_size[1]),
            },
        }
    }

    /// Load a JSON cascade from disk.
    pub fn load(path: &Path, config: &DetectorConfig) -> Result<Self, DetectorError> {
        let cascade = HaarCascade::from_file(path)?;
        tracing::info!(
            path = %path.display(),
            window = ?cascade.window,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(Self::new(cascade, config))
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.cascade.detect_multi_scale(gray, &self.params))
    }

    fn name(&self) -> &'static str {
        "haar_cascade"
    }
}

/// Drop boxes under `min_size` and keep at most `max_faces`, largest first.
///
/// Output is ordered by area (descending), ties broken top-to-bottom then
/// left-to-right so the order is stable across calls.
pub fn select_faces(mut boxes: Vec<BoundingBox>, min_size: [u32; 2], max_faces: usize) -> Vec<BoundingBox> {
    boxes.retain(|b| b.width >= min_size[0] && b.height >= min_size[1]);
    boxes.sort_by(|a, b| {
        b.area()
            .cmp(&a.area())
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    if boxes.len() > max_faces {
        tracing::warn!(
            detected = boxes.len(),
            kept = max_faces,
            "too many faces detected, keeping the largest"
        );
        boxes.truncate(max_faces);
    }
    boxes
}

/// Run `detector` on a grayscale copy of `image` shrunk to fit `max_size`,
/// mapping the boxes back to `image` coordinates.
pub fn detect_in_image(
    detector: &dyn FaceDetector,
    image: &DynamicImage,
    max_size: [u32; 2],
) -> Result<Vec<BoundingBox>, DetectorError> {
    let (w, h) = image.dimensions();
    let gray = image.to_luma8();
    let scale = (max_size[0] as f64 / w as f64).min(max_size[1] as f64 / h as f64);
    if scale >= 1.0 {
        return detector.detect(&gray);
    }

    let sw = ((w as f64 * scale).round() as u32).max(1);
    let sh = ((h as f64 * scale).round() as u32).max(1);
    tracing::debug!(from = ?(w, h), to = ?(sw, sh), "downscaling for detection");
    let small = image::imageops::resize(&gray, sw, sh, FilterType::Triangle);
    let (fx, fy) = (w as f64 / sw as f64, h as f64 / sh as f64);
    Ok(detector
        .detect(&small)?
        .into_iter()
        .filter_map(|b| b.rescale(fx, fy).clip_to(w, h))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use image::Luma;

    #[test]
    fn test_select_filters_small_boxes() {
        let boxes = vec![
            BoundingBox::new(0, 0, 29, 40),
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(0, 0, 40, 20),
        ];
        let kept = select_faces(boxes, [30, 30], 50);
        assert_eq!(kept, vec![BoundingBox::new(0, 0, 30, 30)]);
    }

    #[test]
    fn test_select_keeps_largest_when_capped() {
        let boxes = vec![
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(100, 0, 80, 80),
            BoundingBox::new(200, 0, 50, 50),
            BoundingBox::new(300, 0, 60, 60),
        ];
        let kept = select_faces(boxes, [30, 30], 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], BoundingBox::new(100, 0, 80, 80));
        assert_eq!(kept[1], BoundingBox::new(300, 0, 60, 60));
    }

    #[test]
    fn test_select_orders_ties_by_position() {
        let boxes = vec![
            BoundingBox::new(50, 10, 40, 40),
            BoundingBox::new(10, 10, 40, 40),
            BoundingBox::new(10, 0, 40, 40),
        ];
        let kept = select_faces(boxes, [30, 30], 50);
        assert_eq!(
            kept,
            vec![
                BoundingBox::new(10, 0, 40, 40),
                BoundingBox::new(10, 10, 40, 40),
                BoundingBox::new(50, 10, 40, 40),
            ]
        );
    }

    #[test]
    fn test_select_empty() {
        assert!(select_faces(Vec::new(), [30, 30], 50).is_empty());
    }

    #[test]
    fn test_cascade_detector_no_faces() {
        let cascade = HaarCascade::from_json_str(testutil::EDGE_CASCADE_JSON).unwrap();
        let detector = CascadeDetector::new(cascade, &DetectorConfig::default());
        let gray = GrayImage::from_pixel(320, 240, Luma([90]));
        assert!(detector.detect(&gray).unwrap().is_empty());
        assert_eq!(detector.name(), "haar_cascade");
    }

    #[test]
    fn test_cascade_detector_uses_config() {
        let cascade = HaarCascade::from_json_str(testutil::EDGE_CASCADE_JSON).unwrap();
        let config = DetectorConfig {
            min_neighbors: 2,
            min_size: [24, 24],
            ..DetectorConfig::default()
        };
        let detector = CascadeDetector::new(cascade, &config);
        let gray = testutil::edge_pattern_image(160, 160, 40, 40, 48);
        assert!(!detector.detect(&gray).unwrap().is_empty());
    }

    #[test]
    fn test_detect_in_image_maps_back_to_source() {
        let face = testutil::ramp_face(100, testutil::Ramp::Down);
        let img = testutil::compose(800, 400, &[(200, 100, &face)]);
        let full = detect_in_image(&testutil::ComponentDetector, &img, [1920, 1080]).unwrap();
        assert_eq!(full, vec![BoundingBox::new(200, 100, 100, 100)]);

        let scaled = detect_in_image(&testutil::ComponentDetector, &img, [400, 200]).unwrap();
        assert_eq!(scaled.len(), 1);
        let b = scaled[0];
        assert!(b.x.abs_diff(200) <= 4 && b.y.abs_diff(100) <= 4, "{b:?}");
        assert!(b.width.abs_diff(100) <= 8 && b.height.abs_diff(100) <= 8, "{b:?}");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.json");
        std::fs::write(&path, testutil::EDGE_CASCADE_JSON).unwrap();
        let detector = CascadeDetector::load(&path, &DetectorConfig::default()).unwrap();
        assert_eq!(detector.cascade.window, [24, 24]);
    }
}
