//! Synthetic images and stand-in detectors shared by the unit tests.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::BoundingBox;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One stump on a 24x24 window: fires when the left half is brighter than the right.
pub(crate) const EDGE_CASCADE_JSON: &str = r#"{
    "window": [24, 24],
    "features": [{ "rects": [[0, 0, 24, 24, -1.0], [0, 0, 12, 24, 2.0]] }],
    "stages": [{
        "threshold": 0.0,
        "classifiers": [{ "feature": 0, "threshold": 0.5, "left": -1.0, "right": 1.0 }]
    }]
}"#;

/// Grey canvas with a `size` square at (x, y): bright left half, dark right half.
pub(crate) fn edge_pattern_image(width: u32, height: u32, x: u32, y: u32, size: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |px, py| {
        let inside = px >= x && px < x + size && py >= y && py < y + size;
        match (inside, px < x + size / 2) {
            (false, _) => Luma([128]),
            (true, true) => Luma([230]),
            (true, false) => Luma([20]),
        }
    })
}

/// Seeded uniform noise.
pub(crate) fn noise_face(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    GrayImage::from_fn(width, height, |_, _| Luma([rng.gen::<u8>()]))
}

/// Direction in which a ramp face gets brighter.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Ramp {
    Down,
    Up,
    Right,
    Left,
}

/// Square face whose intensity rises by 2 per pixel in one direction, from 10.
///
/// Every pixel is non-zero so the component detector sees one blob, and the
/// ramp stays strictly monotonic through an area downscale.
pub(crate) fn ramp_face(size: u32, ramp: Ramp) -> GrayImage {
    assert!(size <= 123, "ramp would overflow u8");
    let last = size - 1;
    GrayImage::from_fn(size, size, |x, y| {
        let step = match ramp {
            Ramp::Down => y,
            Ramp::Up => last - y,
            Ramp::Right => x,
            Ramp::Left => last - x,
        };
        Luma([(10 + 2 * step) as u8])
    })
}

/// Paste faces onto a black canvas and return it as RGB.
pub(crate) fn compose(width: u32, height: u32, faces: &[(u32, u32, &GrayImage)]) -> DynamicImage {
    let mut canvas = GrayImage::new(width, height);
    for (x, y, face) in faces {
        image::imageops::replace(&mut canvas, *face, *x as i64, *y as i64);
    }
    DynamicImage::ImageLuma8(canvas).to_rgb8().into()
}

/// Reports the bounding box of every 8-connected non-black region.
pub(crate) struct ComponentDetector;

impl FaceDetector for ComponentDetector {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let labels = connected_components(gray, Connectivity::Eight, Luma([0u8]));
        let mut extents: BTreeMap<u32, (u32, u32, u32, u32)> = BTreeMap::new();
        for (x, y, p) in labels.enumerate_pixels() {
            let label = p[0];
            if label == 0 {
                continue;
            }
            let e = extents.entry(label).or_insert((x, y, x, y));
            e.0 = e.0.min(x);
            e.1 = e.1.min(y);
            e.2 = e.2.max(x);
            e.3 = e.3.max(y);
        }
        Ok(extents
            .values()
            .map(|&(x0, y0, x1, y1)| BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
            .collect())
    }

    fn name(&self) -> &'static str {
        "connected_components"
    }
}

/// Returns a fixed answer and counts how often it was asked.
pub(crate) struct ScriptedDetector {
    boxes: Option<Vec<BoundingBox>>,
    pub(crate) calls: AtomicUsize,
}

impl ScriptedDetector {
    pub(crate) fn returning(boxes: Vec<BoundingBox>) -> Self {
        Self {
            boxes: Some(boxes),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            boxes: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, _gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.boxes
            .clone()
            .ok_or_else(|| DetectorError::Failed("scripted failure".into()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_detector_finds_pasted_faces() {
        let a = ramp_face(60, Ramp::Down);
        let b = ramp_face(40, Ramp::Right);
        let img = compose(300, 200, &[(10, 20, &a), (200, 100, &b)]);
        let mut boxes = ComponentDetector.detect(&img.to_luma8()).unwrap();
        boxes.sort_by_key(|b| b.x);
        assert_eq!(
            boxes,
            vec![BoundingBox::new(10, 20, 60, 60), BoundingBox::new(200, 100, 40, 40)]
        );
    }

    #[test]
    fn test_ramp_is_monotonic() {
        let face = ramp_face(120, Ramp::Down);
        assert_eq!(face.get_pixel(5, 0)[0], 10);
        assert_eq!(face.get_pixel(5, 119)[0], 248);
        let up = ramp_face(120, Ramp::Up);
        assert_eq!(up.get_pixel(5, 0)[0], 248);
    }
}
