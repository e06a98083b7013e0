//! One recognition call: detect, normalise and match every face, then annotate.

use crate::annotate::Annotator;
use crate::detector::{detect_in_image, select_faces, DetectorError, FaceDetector};
use crate::matcher::{ConfidenceTier, MatchOutcome, Matcher, UnknownReason};
use crate::model::{ModelSnapshot, ModelState};
use crate::preprocess::Preprocessor;
use crate::types::{BoundingBox, IdentityRecord};
use base64::Engine as _;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use serde::{Serialize, Serializer};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("face detection failed: {0}")]
    Detection(#[from] DetectorError),
}

/// Where the image came from; selects latency/quality trade-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Upload,
    CameraCapture,
    StreamFrame,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizeOptions {
    pub mode: CaptureMode,
    /// Overrides the configured face cap.
    pub max_faces: Option<usize>,
    /// Overrides the configured distance threshold.
    pub threshold: Option<f64>,
    /// Overrides the detection working resolution.
    pub working_size: Option<[u32; 2]>,
    pub annotate: bool,
}

impl RecognizeOptions {
    pub fn upload() -> Self {
        Self {
            mode: CaptureMode::Upload,
            max_faces: None,
            threshold: None,
            working_size: None,
            annotate: true,
        }
    }

    pub fn camera_capture() -> Self {
        Self {
            mode: CaptureMode::CameraCapture,
            ..Self::upload()
        }
    }

    /// Small face cap, low working resolution, no annotated image.
    pub fn stream_frame() -> Self {
        Self {
            mode: CaptureMode::StreamFrame,
            max_faces: Some(10),
            threshold: None,
            working_size: Some([640, 480]),
            annotate: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = Some(max_faces);
        self
    }

    /// Reject overrides that would silently change what a call means.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        if self.max_faces == Some(0) {
            return Err(RecognitionError::InvalidOptions("max_faces must be at least 1".into()));
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() || t < 0.0 {
                return Err(RecognitionError::InvalidOptions(format!(
                    "threshold must be a finite non-negative distance, got {t}"
                )));
            }
        }
        if let Some([w, h]) = self.working_size {
            if w == 0 || h == 0 {
                return Err(RecognitionError::InvalidOptions(format!("working size {w}x{h} is empty")));
            }
        }
        Ok(())
    }
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self::upload()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceOutcome {
    Known {
        identity: IdentityRecord,
        distance: f64,
        confidence: f64,
        tier: ConfidenceTier,
    },
    Unknown {
        #[serde(skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
        reason: UnknownReason,
    },
    /// This face could not be processed; other faces were unaffected.
    Error { error: String },
}

impl FaceOutcome {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }
}

impl From<MatchOutcome> for FaceOutcome {
    fn from(outcome: MatchOutcome) -> Self {
        match outcome {
            MatchOutcome::Known {
                identity,
                distance,
                confidence,
                tier,
                ..
            } => Self::Known {
                identity,
                distance,
                confidence,
                tier,
            },
            MatchOutcome::Unknown { distance, reason } => Self::Unknown { distance, reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedFace {
    pub face_index: usize,
    pub bbox: BoundingBox,
    pub outcome: FaceOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Completed,
    CompletedEmpty,
}

/// Wall-clock time per phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub detection_ms: f64,
    pub preprocessing_ms: f64,
    pub matching_ms: f64,
    pub annotation_ms: f64,
    pub total_ms: f64,
}

/// Annotated copy of the input. Serialises as base64-encoded PNG.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedImage(pub RgbImage);

impl AnnotatedImage {
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.0.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        self.0.save(path)
    }
}

impl Serialize for AnnotatedImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let png = self.to_png().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(png))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub status: CallStatus,
    pub mode: CaptureMode,
    pub image_width: u32,
    pub image_height: u32,
    pub faces: Vec<RecognizedFace>,
    pub total_faces_detected: usize,
    pub total_faces_recognized: usize,
    pub total_faces_unknown: usize,
    pub total_face_errors: usize,
    pub threshold: f64,
    pub model_generation: u64,
    pub model_state: ModelState,
    pub detector: &'static str,
    pub matcher: &'static str,
    pub timings: PhaseTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<AnnotatedImage>,
}

fn ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Stateless per-call orchestration; safe to share between threads.
pub struct RecognitionPipeline {
    detector: Arc<dyn FaceDetector>,
    preprocessor: Preprocessor,
    matcher: Matcher,
    annotator: Annotator,
    min_size: [u32; 2],
    max_faces: usize,
    max_image_size: [u32; 2],
}

impl RecognitionPipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        preprocessor: Preprocessor,
        matcher: Matcher,
        annotator: Annotator,
        min_size: [u32; 2],
        max_faces: usize,
        max_image_size: [u32; 2],
    ) -> Self {
        Self {
            detector,
            preprocessor,
            matcher,
            annotator,
            min_size,
            max_faces,
            max_image_size,
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Recognize every face in `image` against one model snapshot.
    ///
    /// Only an unusable image, invalid options or a detector failure fails the call; problems
    /// with individual faces are reported as [`FaceOutcome::Error`].
    pub fn recognize(
        &self,
        image: &DynamicImage,
        snapshot: &ModelSnapshot,
        model_state: ModelState,
        options: &RecognizeOptions,
    ) -> Result<RecognitionResult, RecognitionError> {
        options.validate()?;
        let started = Instant::now();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(RecognitionError::InvalidImage(format!("image is {width}x{height}")));
        }
        let threshold = options.threshold.unwrap_or(self.matcher.default_threshold());
        let max_faces = options.max_faces.unwrap_or(self.max_faces);
        let working = options.working_size.unwrap_or(self.max_image_size);
        let mut timings = PhaseTimings::default();

        let t = Instant::now();
        let boxes = detect_in_image(self.detector.as_ref(), image, working)?;
        let boxes = select_faces(boxes, self.min_size, max_faces);
        timings.detection_ms = ms(t);
        tracing::debug!(faces = boxes.len(), elapsed_ms = timings.detection_ms, "detection done");

        let model = snapshot.trained();
        let mut faces = Vec::with_capacity(boxes.len());
        for (face_index, bbox) in boxes.into_iter().enumerate() {
            let t = Instant::now();
            let canonical = self.preprocessor.normalize(image, &bbox);
            timings.preprocessing_ms += ms(t);

            let outcome = match canonical {
                Ok(face) => {
                    let t = Instant::now();
                    let matched = self.matcher.match_face(&face, model, threshold);
                    timings.matching_ms += ms(t);
                    match matched {
                        Ok(m) => FaceOutcome::from(m),
                        Err(e) => FaceOutcome::Error { error: e.to_string() },
                    }
                }
                Err(e) => FaceOutcome::Error { error: e.to_string() },
            };
            tracing::debug!(face_index, ?bbox, ?outcome, "face processed");
            faces.push(RecognizedFace {
                face_index,
                bbox,
                outcome,
            });
        }

        let detected = faces.len();
        let recognized = faces.iter().filter(|f| f.outcome.is_known()).count();
        let errors = faces
            .iter()
            .filter(|f| matches!(f.outcome, FaceOutcome::Error { .. }))
            .count();

        let status = if detected == 0 {
            CallStatus::CompletedEmpty
        } else {
            CallStatus::Completed
        };
        let annotated_image = if options.annotate && status == CallStatus::Completed {
            let t = Instant::now();
            let annotated = self.annotator.annotate(image, &faces);
            timings.annotation_ms = ms(t);
            Some(AnnotatedImage(annotated))
        } else {
            None
        };
        timings.total_ms = ms(started);

        tracing::info!(
            mode = ?options.mode,
            detected,
            recognized,
            errors,
            elapsed_ms = timings.total_ms,
            "recognition completed"
        );

        Ok(RecognitionResult {
            status,
            mode: options.mode,
            image_width: width,
            image_height: height,
            faces,
            total_faces_detected: detected,
            total_faces_recognized: recognized,
            total_faces_unknown: detected - recognized - errors,
            total_face_errors: errors,
            threshold,
            model_generation: snapshot.generation(),
            model_state,
            detector: self.detector.name(),
            matcher: self.matcher.name(),
            timings,
            annotated_image,
        })
    }
}
