//! facelookup-core: Face recognition engine.
//!
//! Detects faces with a Haar cascade, normalises them, and identifies them
//! against enrolled people with Local Binary Pattern Histograms. The trained
//! model is shared by all callers and rebuilt as enrollment changes.

pub mod annotate;
pub mod cascade;
pub mod config;
pub mod detector;
pub mod engine;
pub mod enrollment;
pub mod lbph;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use detector::{CascadeDetector, FaceDetector};
pub use engine::{EngineError, EngineStatus, FaceEngine};
pub use enrollment::{EnrolledIdentity, EnrollmentError, EnrollmentSource, FaceSample, InMemoryEnrollment};
pub use model::{ModelState, ModelStatus};
pub use pipeline::{FaceOutcome, RecognitionError, RecognitionResult, RecognizeOptions};
pub use types::{BoundingBox, IdentityId, IdentityMetadata, IdentityRecord};

/// Default directory for cascade files: `$XDG_DATA_HOME/facelookup/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("facelookup").join("models")
}
