//! The engine facade: what the host process calls.

use crate::annotate::Annotator;
use crate::config::{ConfigError, EngineConfig};
use crate::detector::{CascadeDetector, DetectorError, FaceDetector};
use crate::enrollment::{EnrollmentSource, SampleExtractor};
use crate::matcher::Matcher;
use crate::model::{ModelError, ModelManager, ModelStatus};
use crate::pipeline::{RecognitionError, RecognitionPipeline, RecognitionResult, RecognizeOptions};
use crate::preprocess::Preprocessor;
use image::DynamicImage;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

/// Model status plus the engine settings health checks report.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub model: ModelStatus,
    pub threshold: f64,
    pub canonical_size: [u32; 2],
    pub detector: &'static str,
    pub matcher: &'static str,
}

/// Shared, thread-safe recognition engine.
pub struct FaceEngine {
    config: EngineConfig,
    manager: Arc<ModelManager>,
    pipeline: RecognitionPipeline,
}

impl FaceEngine {
    pub fn new(
        config: EngineConfig,
        detector: Arc<dyn FaceDetector>,
        source: Arc<dyn EnrollmentSource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let preprocessor = Preprocessor::new(config.preprocess.canonical_size);
        let extractor = SampleExtractor::new(
            Arc::clone(&detector),
            preprocessor,
            config.detector.min_size,
            config.pipeline.max_image_size,
        );
        let manager = ModelManager::new(source, extractor, config.lbph, config.model.clone());
        let pipeline = RecognitionPipeline::new(
            detector,
            preprocessor,
            Matcher::new(config.matcher.clone()),
            Annotator::new(config.annotation.clone()),
            config.detector.min_size,
            config.detector.max_faces,
            config.pipeline.max_image_size,
        );
        tracing::info!(
            detector = pipeline.detector_name(),
            threshold = config.matcher.threshold,
            staleness = config.model.staleness.as_str(),
            "face engine ready"
        );
        Ok(Self {
            config,
            manager,
            pipeline,
        })
    }

    /// Build an engine around a Haar cascade loaded from `cascade_path`.
    pub fn with_cascade(
        config: EngineConfig,
        cascade_path: &Path,
        source: Arc<dyn EnrollmentSource>,
    ) -> Result<Self, EngineError> {
        let detector = CascadeDetector::load(cascade_path, &config.detector)?;
        Self::new(config, Arc::new(detector), source)
    }

    /// Recognize every face in `image`. The model snapshot is fixed for the
    /// duration of the call.
    pub fn recognize(
        &self,
        image: &DynamicImage,
        options: &RecognizeOptions,
    ) -> Result<RecognitionResult, RecognitionError> {
        let snapshot = self.manager.current_model();
        let state = self.manager.state_of(&snapshot);
        self.pipeline.recognize(image, &snapshot, state, options)
    }

    /// Rebuild now, blocking until the new model is active.
    pub fn rebuild_model(&self) -> Result<EngineStatus, ModelError> {
        self.manager.rebuild()?;
        Ok(self.model_status())
    }

    pub fn invalidate_model(&self) {
        self.manager.invalidate();
    }

    /// Enrollment change notification from the admin side.
    pub fn on_enrollment_changed(&self) {
        self.invalidate_model();
    }

    pub fn model_status(&self) -> EngineStatus {
        EngineStatus {
            model: self.manager.status(),
            threshold: self.config.matcher.threshold,
            canonical_size: self.config.preprocess.canonical_size,
            detector: self.pipeline.detector_name(),
            matcher: self.pipeline.matcher().name(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
