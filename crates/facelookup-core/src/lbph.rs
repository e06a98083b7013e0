//! Local Binary Pattern Histograms.
//!
//! Each training sample is reduced to a concatenation of per-cell LBP
//! histograms. Prediction is a nearest-neighbour search under the
//! chi-square distance, so lower is more similar and an identical image
//! scores exactly zero.

use crate::config::LbphConfig;
use crate::preprocess::CanonicalFace;
use crate::types::{IdentityId, IdentityRecord};
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LbphError {
    #[error("no training samples")]
    NoSamples,
    #[error("face is {got:?}, model expects {expected:?}")]
    SizeMismatch { expected: [u32; 2], got: [u32; 2] },
    #[error("{width}x{height} is too small for radius {radius} and a {grid_x}x{grid_y} grid")]
    TooSmall {
        width: u32,
        height: u32,
        radius: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("model is corrupt: {0}")]
    Corrupt(String),
    #[error("model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("model json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Nearest training sample for a query face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: u32,
    pub distance: f64,
}

/// Trained LBPH model: one spatial histogram per training sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphConfig,
    face_size: [u32; 2],
    labels: Vec<u32>,
    histograms: Vec<Vec<f32>>,
}

impl LbphModel {
    /// Train on `(label, face)` pairs. All faces must share one size.
    pub fn train(params: LbphConfig, samples: &[(u32, &CanonicalFace)]) -> Result<Self, LbphError> {
        let (_, first) = samples.first().ok_or(LbphError::NoSamples)?;
        let (w, h) = first.dimensions();
        check_geometry(&params, w, h)?;

        let mut labels = Vec::with_capacity(samples.len());
        let mut histograms = Vec::with_capacity(samples.len());
        for (label, face) in samples {
            let got = face.dimensions();
            if got != (w, h) {
                return Err(LbphError::SizeMismatch {
                    expected: [w, h],
                    got: [got.0, got.1],
                });
            }
            labels.push(*label);
            histograms.push(describe(&params, face.image()));
        }

        Ok(Self {
            params,
            face_size: [w, h],
            labels,
            histograms,
        })
    }

    /// Closest training sample. Ties go to the earliest sample.
    pub fn predict(&self, face: &CanonicalFace) -> Result<Prediction, LbphError> {
        let (w, h) = face.dimensions();
        if [w, h] != self.face_size {
            return Err(LbphError::SizeMismatch {
                expected: self.face_size,
                got: [w, h],
            });
        }
        let query = describe(&self.params, face.image());

        let mut best: Option<Prediction> = None;
        for (label, hist) in self.labels.iter().zip(&self.histograms) {
            let distance = chi_square(hist, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: *label,
                    distance,
                });
            }
        }
        best.ok_or(LbphError::NoSamples)
    }

    pub fn params(&self) -> LbphConfig {
        self.params
    }

    pub fn face_size(&self) -> [u32; 2] {
        self.face_size
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Structural checks for a model read back from disk.
    pub fn verify(&self) -> Result<(), LbphError> {
        if self.labels.is_empty() {
            return Err(LbphError::NoSamples);
        }
        check_geometry(&self.params, self.face_size[0], self.face_size[1])?;
        if self.labels.len() != self.histograms.len() {
            return Err(LbphError::Corrupt(format!(
                "{} labels but {} histograms",
                self.labels.len(),
                self.histograms.len()
            )));
        }
        let expected = histogram_len(&self.params);
        if let Some(bad) = self.histograms.iter().position(|h| h.len() != expected) {
            return Err(LbphError::Corrupt(format!(
                "histogram {bad} has {} bins, expected {expected}",
                self.histograms[bad].len()
            )));
        }
        Ok(())
    }
}

fn check_geometry(params: &LbphConfig, width: u32, height: u32) -> Result<(), LbphError> {
    let inner_w = width.saturating_sub(2 * params.radius);
    let inner_h = height.saturating_sub(2 * params.radius);
    if inner_w < params.grid_x || inner_h < params.grid_y {
        return Err(LbphError::TooSmall {
            width,
            height,
            radius: params.radius,
            grid_x: params.grid_x,
            grid_y: params.grid_y,
        });
    }
    Ok(())
}

fn histogram_len(params: &LbphConfig) -> usize {
    (params.grid_x * params.grid_y) as usize * (1usize << params.neighbors)
}

fn describe(params: &LbphConfig, image: &GrayImage) -> Vec<f32> {
    let (codes, w, h) = local_binary_pattern(image, params.radius, params.neighbors);
    spatial_histogram(&codes, w, h, params)
}

/// Circular LBP with bilinear sampling.
///
/// Returns the codes row-major together with the output size, which loses
/// `radius` pixels on each side.
pub fn local_binary_pattern(image: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, u32, u32) {
    let (w, h) = image.dimensions();
    let out_w = w.saturating_sub(2 * radius);
    let out_h = h.saturating_sub(2 * radius);
    let mut codes = vec![0u32; (out_w * out_h) as usize];
    if out_w == 0 || out_h == 0 {
        return (codes, out_w, out_h);
    }

    let px = |x: i64, y: i64| image.get_pixel(x as u32, y as u32)[0] as f32;
    let r = radius as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / neighbors as f32;
        let x = r * angle.cos();
        let y = -r * angle.sin();
        let (fx, fy) = (x.floor(), y.floor());
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let (tx, ty) = (x - fx, y - fy);
        let (fx, fy) = (fx as i64, fy as i64);

        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for row in radius..h - radius {
            for col in radius..w - radius {
                let (i, j) = (row as i64, col as i64);
                let center = px(j, i);
                // Interpolated sample minus center, summed over differences so
                // flat neighbourhoods come out exactly zero.
                let d = w1 * (px(j + fx, i + fy) - center)
                    + w2 * (px(j + cx, i + fy) - center)
                    + w3 * (px(j + fx, i + cy) - center)
                    + w4 * (px(j + cx, i + cy) - center);
                if d > 0.0 || d.abs() < f32::EPSILON {
                    let idx = ((row - radius) * out_w + (col - radius)) as usize;
                    codes[idx] |= 1 << n;
                }
            }
        }
    }
    (codes, out_w, out_h)
}

/// Concatenate per-cell histograms, each normalised by the cell's pixel count.
///
/// Cells are `width / grid_x` by `height / grid_y`; remainder pixels on the
/// right and bottom edges are not counted.
pub fn spatial_histogram(codes: &[u32], width: u32, height: u32, params: &LbphConfig) -> Vec<f32> {
    let bins = 1usize << params.neighbors;
    let cell_w = width / params.grid_x;
    let cell_h = height / params.grid_y;
    let cell_total = (cell_w * cell_h) as f32;
    let mut out = vec![0f32; histogram_len(params)];
    if cell_total == 0.0 {
        return out;
    }

    for gy in 0..params.grid_y {
        for gx in 0..params.grid_x {
            let base = (gy * params.grid_x + gx) as usize * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    let code = codes[(y * width + x) as usize] as usize;
                    out[base + code] += 1.0;
                }
            }
            for v in &mut out[base..base + bins] {
                *v /= cell_total;
            }
        }
    }
    out
}

/// Symmetric chi-square distance, `2 * Σ (a - b)² / (a + b)`.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&a, &b)| {
            let (a, b) = (a as f64, b as f64);
            let s = a + b;
            if s.abs() > f64::EPSILON {
                (a - b) * (a - b) / s
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}

/// Label to identity mapping for one model build. Label `n` is entry `n`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelMap {
    entries: Vec<IdentityRecord>,
}

impl LabelMap {
    /// Assign labels `0..n` in the given order.
    pub fn from_records(entries: Vec<IdentityRecord>) -> Self {
        Self { entries }
    }

    pub fn get(&self, label: u32) -> Option<&IdentityRecord> {
        self.entries.get(label as usize)
    }

    pub fn label_of(&self, id: IdentityId) -> Option<u32> {
        self.entries.iter().position(|r| r.id == id).map(|i| i as u32)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &IdentityRecord)> {
        self.entries.iter().enumerate().map(|(i, r)| (i as u32, r))
    }
}

/// A model together with the label map it was trained against.
///
/// The two are only ever constructed, stored and swapped as one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    model: LbphModel,
    label_map: LabelMap,
    built_at: DateTime<Utc>,
}

impl TrainedModel {
    pub fn new(model: LbphModel, label_map: LabelMap) -> Result<Self, LbphError> {
        let trained = Self {
            model,
            label_map,
            built_at: Utc::now(),
        };
        trained.check()?;
        Ok(trained)
    }

    fn check(&self) -> Result<(), LbphError> {
        self.model.verify()?;
        if let Some(&label) = self.model.labels().iter().find(|&&l| self.label_map.get(l).is_none()) {
            return Err(LbphError::Corrupt(format!(
                "label {label} missing from a map of {} identities",
                self.label_map.len()
            )));
        }
        Ok(())
    }

    pub fn model(&self) -> &LbphModel {
        &self.model
    }

    pub fn label_map(&self) -> &LabelMap {
        &self.label_map
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Write as JSON via a temporary file renamed into place.
    pub fn save(&self, path: &Path) -> Result<(), LbphError> {
        let io = |source| LbphError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(self)?;
        std::fs::write(&tmp, json).map_err(io)?;
        std::fs::rename(&tmp, path).map_err(io)?;
        tracing::debug!(path = %path.display(), samples = self.model.sample_count(), "model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, LbphError> {
        let bytes = std::fs::read(path).map_err(|source| LbphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trained: Self = serde_json::from_slice(&bytes)?;
        trained.check()?;
        Ok(trained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use image::Luma;

    fn face(image: GrayImage) -> CanonicalFace {
        CanonicalFace::from_preprocessed(image)
    }

    #[test]
    fn test_lbp_output_size() {
        let img = GrayImage::from_pixel(20, 12, Luma([9]));
        let (codes, w, h) = local_binary_pattern(&img, 2, 8);
        assert_eq!((w, h), (16, 8));
        assert_eq!(codes.len(), 128);
    }

    #[test]
    fn test_lbp_flat_image_sets_all_bits() {
        let img = GrayImage::from_pixel(10, 10, Luma([100]));
        let (codes, _, _) = local_binary_pattern(&img, 1, 8);
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_lbp_bright_center_clears_bits() {
        let mut img = GrayImage::from_pixel(3, 3, Luma([10]));
        img.put_pixel(1, 1, Luma([200]));
        let (codes, w, h) = local_binary_pattern(&img, 1, 8);
        assert_eq!((w, h), (1, 1));
        assert_eq!(codes[0], 0);
    }

    #[test]
    fn test_histogram_cells_sum_to_one() {
        let params = LbphConfig::default();
        let img = testutil::noise_face(100, 100, 3);
        let (codes, w, h) = local_binary_pattern(&img, params.radius, params.neighbors);
        let hist = spatial_histogram(&codes, w, h, &params);
        assert_eq!(hist.len(), 64 * 256);
        for cell in hist.chunks(256) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_chi_square_basics() {
        let a = [0.5, 0.5, 0.0];
        let b = [0.0, 0.5, 0.5];
        assert_eq!(chi_square(&a, &a), 0.0);
        assert_eq!(chi_square(&a, &b), chi_square(&b, &a));
        assert!((chi_square(&a, &b) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_face_has_zero_distance() {
        let a = face(testutil::noise_face(100, 100, 1));
        let b = face(testutil::noise_face(100, 100, 2));
        let model = LbphModel::train(LbphConfig::default(), &[(0, &a), (1, &b)]).unwrap();
        let p = model.predict(&b).unwrap();
        assert_eq!(p.label, 1);
        assert_eq!(p.distance, 0.0);
    }

    #[test]
    fn test_distinct_textures_are_far_apart() {
        let rows = face(testutil::ramp_face(100, testutil::Ramp::Down));
        let cols = face(testutil::ramp_face(100, testutil::Ramp::Right));
        let model = LbphModel::train(LbphConfig::default(), &[(7, &rows)]).unwrap();
        assert_eq!(model.predict(&rows).unwrap().distance, 0.0);
        let p = model.predict(&cols).unwrap();
        assert_eq!(p.label, 7);
        assert!(p.distance > 200.0, "distance {}", p.distance);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let train: Vec<_> = (0..4).map(|s| face(testutil::noise_face(100, 100, s))).collect();
        let samples: Vec<_> = train.iter().enumerate().map(|(i, f)| (i as u32 / 2, f)).collect();
        let model = LbphModel::train(LbphConfig::default(), &samples).unwrap();
        let probe = face(testutil::noise_face(100, 100, 99));
        let first = model.predict(&probe).unwrap();
        for _ in 0..5 {
            assert_eq!(model.predict(&probe).unwrap(), first);
        }
    }

    #[test]
    fn test_train_rejects_empty_and_mixed_sizes() {
        assert!(matches!(
            LbphModel::train(LbphConfig::default(), &[]),
            Err(LbphError::NoSamples)
        ));
        let a = face(GrayImage::new(100, 100));
        let b = face(GrayImage::new(90, 100));
        assert!(matches!(
            LbphModel::train(LbphConfig::default(), &[(0, &a), (1, &b)]),
            Err(LbphError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_train_rejects_tiny_faces() {
        let tiny = face(GrayImage::new(8, 8));
        assert!(matches!(
            LbphModel::train(LbphConfig::default(), &[(0, &tiny)]),
            Err(LbphError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_predict_rejects_wrong_size() {
        let a = face(GrayImage::new(100, 100));
        let model = LbphModel::train(LbphConfig::default(), &[(0, &a)]).unwrap();
        let other = face(GrayImage::new(64, 64));
        assert!(matches!(model.predict(&other), Err(LbphError::SizeMismatch { .. })));
    }

    #[test]
    fn test_verify_detects_truncated_histogram() {
        let a = face(testutil::noise_face(100, 100, 5));
        let mut model = LbphModel::train(LbphConfig::default(), &[(0, &a)]).unwrap();
        assert!(model.verify().is_ok());
        model.histograms[0].pop();
        assert!(matches!(model.verify(), Err(LbphError::Corrupt(_))));
    }

    fn record(id: i64, name: &str) -> IdentityRecord {
        IdentityRecord {
            id: IdentityId(id),
            name: name.to_string(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_label_map_lookup() {
        let map = LabelMap::from_records(vec![record(42, "Ada"), record(7, "Grace")]);
        assert_eq!(map.get(1).map(|r| r.name.as_str()), Some("Grace"));
        assert_eq!(map.label_of(IdentityId(42)), Some(0));
        assert_eq!(map.label_of(IdentityId(1)), None);
        assert!(map.get(2).is_none());
    }

    #[test]
    fn test_trained_model_rejects_unmapped_label() {
        let a = face(testutil::noise_face(100, 100, 1));
        let model = LbphModel::train(LbphConfig::default(), &[(3, &a)]).unwrap();
        let map = LabelMap::from_records(vec![record(1, "Only")]);
        assert!(matches!(TrainedModel::new(model, map), Err(LbphError::Corrupt(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("model.json");
        let a = face(testutil::noise_face(100, 100, 1));
        let b = face(testutil::noise_face(100, 100, 2));
        let model = LbphModel::train(LbphConfig::default(), &[(0, &a), (1, &b)]).unwrap();
        let map = LabelMap::from_records(vec![record(10, "Ada"), record(20, "Grace")]);
        let trained = TrainedModel::new(model, map).unwrap();
        trained.save(&path).unwrap();

        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded.model(), trained.model());
        assert_eq!(loaded.label_map(), trained.label_map());
        assert_eq!(loaded.built_at(), trained.built_at());
        let p = loaded.model().predict(&b).unwrap();
        assert_eq!(loaded.label_map().get(p.label).unwrap().id, IdentityId(20));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TrainedModel::load(Path::new("/nonexistent/model.json")).unwrap_err();
        assert!(matches!(err, LbphError::Io { .. }));
    }
}
