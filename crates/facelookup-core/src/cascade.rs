//! Haar cascade evaluation.
//!
//! Stump-based boosted cascade in the Viola-Jones layout: every stage sums the
//! votes of its weak classifiers and rejects the window when the sum falls
//! below the stage threshold. Features are scaled instead of the image, so one
//! pair of integral images serves every pyramid level.

use crate::detector::DetectorError;
use crate::types::BoundingBox;
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Similarity tolerance used when grouping raw windows.
const GROUP_EPS: f64 = 0.2;

/// A trained cascade, deserialised from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    /// Base detection window `[width, height]`.
    pub window: [u32; 2],
    pub features: Vec<HaarFeature>,
    pub stages: Vec<Stage>,
}

/// Weighted rectangles `[x, y, width, height, weight]` inside the base window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<[f64; 5]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub classifiers: Vec<Stump>,
}

/// Single-split weak classifier: `left` when the normalised feature is below
/// `threshold`, `right` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    pub left: f64,
    pub right: f64,
}

/// Scan parameters for [`HaarCascade::detect_multi_scale`].
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub min_size: (u32, u32),
}

impl HaarCascade {
    pub fn from_json_str(json: &str) -> Result<Self, DetectorError> {
        let cascade: HaarCascade = serde_json::from_str(json)?;
        cascade.validate()?;
        Ok(cascade)
    }

    pub fn from_file(path: &Path) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<(), DetectorError> {
        let [ww, wh] = self.window;
        if ww < 2 || wh < 2 {
            return Err(DetectorError::InvalidCascade(format!("window {ww}x{wh} too small")));
        }
        if self.stages.is_empty() {
            return Err(DetectorError::InvalidCascade("cascade has no stages".into()));
        }
        for (i, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(DetectorError::InvalidCascade(format!("feature {i} has no rects")));
            }
            for r in &feature.rects {
                let (x, y, w, h) = (r[0], r[1], r[2], r[3]);
                if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 || x + w > ww as f64 || y + h > wh as f64 {
                    return Err(DetectorError::InvalidCascade(format!(
                        "feature {i} rect {r:?} outside {ww}x{wh} window"
                    )));
                }
            }
        }
        for (s, stage) in self.stages.iter().enumerate() {
            for stump in &stage.classifiers {
                if stump.feature >= self.features.len() {
                    return Err(DetectorError::InvalidCascade(format!(
                        "stage {s} references missing feature {}",
                        stump.feature
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run the cascade over every position and scale, then group the raw hits.
    pub fn detect_multi_scale(&self, gray: &GrayImage, params: &ScanParams) -> Vec<BoundingBox> {
        let (width, height) = gray.dimensions();
        let [ww, wh] = self.window;
        if width < ww || height < wh {
            return Vec::new();
        }

        let integrals = Integrals::new(gray);
        let mut raw = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            if win_w > width || win_h > height {
                break;
            }

            if win_w >= params.min_size.0 && win_h >= params.min_size.1 {
                let scaled = ScaledCascade::new(self, factor);
                let step = (factor * if factor > 2.0 { 1.0 } else { 2.0 }).round().max(1.0) as usize;
                for y in (0..=(height - win_h)).step_by(step) {
                    for x in (0..=(width - win_w)).step_by(step) {
                        if scaled.accepts(&integrals, x, y) {
                            raw.push(BoundingBox::new(x, y, win_w, win_h));
                        }
                    }
                }
            }

            factor *= params.scale_factor;
        }

        tracing::debug!(raw = raw.len(), "cascade scan complete");
        group_rectangles(&raw, params.min_neighbors, GROUP_EPS)
    }
}

/// Summed-area tables for pixel values and their squares.
struct Integrals {
    sum: Image<Luma<u64>>,
    sq: Image<Luma<u64>>,
}

impl Integrals {
    fn new(gray: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(gray),
            sq: integral_squared_image::<_, u64>(gray),
        }
    }

    /// Sum over `[x, x+w) × [y, y+h)`. Tables carry a leading zero row and column.
    fn rect(table: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let a = table.get_pixel(x, y)[0];
        let b = table.get_pixel(x + w, y)[0];
        let c = table.get_pixel(x, y + h)[0];
        let d = table.get_pixel(x + w, y + h)[0];
        (d + a) as f64 - (b + c) as f64
    }
}

struct ScaledRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    weight: f64,
}

/// Cascade with feature geometry resolved for one pyramid level.
struct ScaledCascade<'a> {
    cascade: &'a HaarCascade,
    features: Vec<Vec<ScaledRect>>,
    /// Variance window: the scaled base window minus a one-pixel border.
    norm: (u32, u32, u32, u32),
    inv_area: f64,
}

impl<'a> ScaledCascade<'a> {
    fn new(cascade: &'a HaarCascade, factor: f64) -> Self {
        let [ww, wh] = cascade.window;
        let win_w = (ww as f64 * factor).round() as u32;
        let win_h = (wh as f64 * factor).round() as u32;

        let features = cascade
            .features
            .iter()
            .map(|f| {
                let mut rects: Vec<ScaledRect> = f
                    .rects
                    .iter()
                    .map(|r| {
                        let x = ((r[0] * factor).round() as u32).min(win_w - 1);
                        let y = ((r[1] * factor).round() as u32).min(win_h - 1);
                        ScaledRect {
                            x,
                            y,
                            w: ((r[2] * factor).round() as u32).clamp(1, win_w - x),
                            h: ((r[3] * factor).round() as u32).clamp(1, win_h - y),
                            weight: r[4],
                        }
                    })
                    .collect();
                // Rounding changes rect areas; re-balance the first weight so a
                // flat patch still sums to zero.
                if rects.len() > 1 {
                    let area0 = (rects[0].w * rects[0].h) as f64;
                    let rest: f64 = rects[1..].iter().map(|r| r.weight * (r.w * r.h) as f64).sum();
                    rects[0].weight = -rest / area0;
                }
                rects
            })
            .collect();

        let border = (factor.round() as u32).clamp(1, win_w.min(win_h) / 2);
        let nw = (((ww - 2) as f64 * factor).round() as u32).clamp(1, win_w - border);
        let nh = (((wh - 2) as f64 * factor).round() as u32).clamp(1, win_h - border);

        Self {
            cascade,
            features,
            norm: (border, border, nw, nh),
            inv_area: 1.0 / (nw as f64 * nh as f64),
        }
    }

    fn accepts(&self, ii: &Integrals, x: u32, y: u32) -> bool {
        let (nx, ny, nw, nh) = self.norm;
        let sum = Integrals::rect(&ii.sum, x + nx, y + ny, nw, nh);
        let sq = Integrals::rect(&ii.sq, x + nx, y + ny, nw, nh);
        let mean = sum * self.inv_area;
        let variance = sq * self.inv_area - mean * mean;
        let nf = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.cascade.stages {
            let mut stage_sum = 0.0;
            for stump in &stage.classifiers {
                let value: f64 = self.features[stump.feature]
                    .iter()
                    .map(|r| r.weight * Integrals::rect(&ii.sum, x + r.x, y + r.y, r.w, r.h))
                    .sum();
                stage_sum += if value * self.inv_area < stump.threshold * nf {
                    stump.left
                } else {
                    stump.right
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar windows and keep clusters with more than `min_neighbors`
/// members, averaged into one box each. Clusters nested inside a stronger one
/// are dropped. `min_neighbors == 0` returns the raw windows.
pub fn group_rectangles(rects: &[BoundingBox], min_neighbors: u32, eps: f64) -> Vec<BoundingBox> {
    if min_neighbors == 0 {
        return rects.to_vec();
    }

    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // root -> (sum x, sum y, sum w, sum h, members)
    let mut clusters: std::collections::BTreeMap<usize, [u64; 5]> = std::collections::BTreeMap::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let acc = clusters.entry(root).or_insert([0; 5]);
        acc[0] += r.x as u64;
        acc[1] += r.y as u64;
        acc[2] += r.width as u64;
        acc[3] += r.height as u64;
        acc[4] += 1;
    }

    let averaged: Vec<(BoundingBox, u64)> = clusters
        .values()
        .filter(|acc| acc[4] > min_neighbors as u64)
        .map(|acc| {
            let n = acc[4] as f64;
            let avg = |v: u64| (v as f64 / n).round() as u32;
            (BoundingBox::new(avg(acc[0]), avg(acc[1]), avg(acc[2]), avg(acc[3])), acc[4])
        })
        .collect();

    averaged
        .iter()
        .enumerate()
        .filter(|(i, (r1, n1))| {
            !averaged.iter().enumerate().any(|(j, (r2, n2))| {
                if *i == j {
                    return false;
                }
                let dx = (r2.width as f64 * eps).round() as i64;
                let dy = (r2.height as f64 * eps).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && r1.right() as i64 <= r2.right() as i64 + dx
                    && r1.bottom() as i64 <= r2.bottom() as i64 + dy;
                inside && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}
