//! Enrollment source seam and sample extraction.
//!
//! Identities live outside the engine. A source lists them on demand, and
//! the extractor turns each identity's photos into canonical faces at build
//! time.

use crate::detector::{detect_in_image, select_faces, FaceDetector};
use crate::preprocess::{CanonicalFace, Preprocessor};
use crate::types::{IdentityId, IdentityMetadata, IdentityRecord};
use image::DynamicImage;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment source unavailable: {0}")]
    Unavailable(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid enrollment data: {0}")]
    Invalid(String),
}

/// One face sample attached to an identity.
#[derive(Debug, Clone)]
pub enum FaceSample {
    /// Source photo on disk, decoded when the model is built.
    Path(PathBuf),
    /// Decoded source photo.
    Image(Arc<DynamicImage>),
    /// Face that has already been normalised; used as is.
    Canonical(CanonicalFace),
}

#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    pub id: IdentityId,
    pub name: String,
    pub metadata: IdentityMetadata,
    pub samples: Vec<FaceSample>,
}

impl EnrolledIdentity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: IdentityId(id),
            name: name.into(),
            metadata: IdentityMetadata::default(),
            samples: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: IdentityMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_sample(mut self, sample: FaceSample) -> Self {
        self.samples.push(sample);
        self
    }

    pub fn record(&self) -> IdentityRecord {
        IdentityRecord {
            id: self.id,
            name: self.name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Read side of the external identity directory.
pub trait EnrollmentSource: Send + Sync {
    /// Every currently enrolled identity with its samples.
    fn list_identities(&self) -> Result<Vec<EnrolledIdentity>, EnrollmentError>;
}

/// Enrollment kept in process memory. Callers notify the engine after edits.
#[derive(Default)]
pub struct InMemoryEnrollment {
    identities: RwLock<BTreeMap<IdentityId, EnrolledIdentity>>,
}

impl InMemoryEnrollment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id.
    pub fn upsert(&self, identity: EnrolledIdentity) {
        self.identities.write().insert(identity.id, identity);
    }

    pub fn remove(&self, id: IdentityId) -> bool {
        self.identities.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }
}

impl EnrollmentSource for InMemoryEnrollment {
    fn list_identities(&self) -> Result<Vec<EnrolledIdentity>, EnrollmentError> {
        Ok(self.identities.read().values().cloned().collect())
    }
}

/// Builds canonical training faces from enrollment samples.
#[derive(Clone)]
pub struct SampleExtractor {
    detector: Arc<dyn FaceDetector>,
    preprocessor: Preprocessor,
    min_size: [u32; 2],
    max_image_size: [u32; 2],
}

impl SampleExtractor {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        preprocessor: Preprocessor,
        min_size: [u32; 2],
        max_image_size: [u32; 2],
    ) -> Self {
        Self {
            detector,
            preprocessor,
            min_size,
            max_image_size,
        }
    }

    pub fn canonical_size(&self) -> (u32, u32) {
        self.preprocessor.canonical_size()
    }

    /// Usable faces for one identity. Unusable samples are logged and skipped.
    pub fn extract(&self, identity: &EnrolledIdentity) -> Vec<CanonicalFace> {
        let faces: Vec<CanonicalFace> = identity
            .samples
            .iter()
            .enumerate()
            .filter_map(|(index, sample)| self.extract_one(identity, index, sample))
            .collect();
        if faces.is_empty() {
            tracing::warn!(
                id = %identity.id,
                name = %identity.name,
                samples = identity.samples.len(),
                "identity has no usable face samples"
            );
        }
        faces
    }

    fn extract_one(&self, identity: &EnrolledIdentity, index: usize, sample: &FaceSample) -> Option<CanonicalFace> {
        match sample {
            FaceSample::Canonical(face) => {
                let expected = self.preprocessor.canonical_size();
                if face.dimensions() != expected {
                    tracing::warn!(
                        id = %identity.id,
                        sample = index,
                        got = ?face.dimensions(),
                        ?expected,
                        "canonical sample has the wrong size, skipped"
                    );
                    return None;
                }
                Some(face.clone())
            }
            FaceSample::Image(image) => self.from_image(identity, index, image),
            FaceSample::Path(path) => match image::open(path) {
                Ok(image) => self.from_image(identity, index, &image),
                Err(e) => {
                    tracing::warn!(id = %identity.id, path = %path.display(), error = %e, "cannot read sample image");
                    None
                }
            },
        }
    }

    fn from_image(&self, identity: &EnrolledIdentity, index: usize, image: &DynamicImage) -> Option<CanonicalFace> {
        let boxes = match detect_in_image(self.detector.as_ref(), image, self.max_image_size) {
            Ok(boxes) => select_faces(boxes, self.min_size, usize::MAX),
            Err(e) => {
                tracing::warn!(id = %identity.id, sample = index, error = %e, "detection failed on sample");
                return None;
            }
        };
        let Some(largest) = boxes.first() else {
            tracing::warn!(id = %identity.id, sample = index, "no face found in sample");
            return None;
        };
        if boxes.len() > 1 {
            tracing::warn!(
                id = %identity.id,
                sample = index,
                faces = boxes.len(),
                "multiple faces in sample, using the largest"
            );
        }
        match self.preprocessor.normalize(image, largest) {
            Ok(face) => Some(face),
            Err(e) => {
                tracing::warn!(id = %identity.id, sample = index, error = %e, "sample face unusable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ComponentDetector, Ramp};
    use image::GrayImage;

    fn extractor() -> SampleExtractor {
        SampleExtractor::new(Arc::new(ComponentDetector), Preprocessor::new([100, 100]), [30, 30], [1920, 1080])
    }

    #[test]
    fn test_in_memory_upsert_and_remove() {
        let store = InMemoryEnrollment::new();
        store.upsert(EnrolledIdentity::new(2, "Grace"));
        store.upsert(EnrolledIdentity::new(1, "Ada"));
        store.upsert(EnrolledIdentity::new(2, "Grace Hopper"));
        let listed = store.list_identities().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].name, "Grace Hopper");

        assert!(store.remove(IdentityId(1)));
        assert!(!store.remove(IdentityId(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_extract_from_photo() {
        let face = testutil::ramp_face(120, Ramp::Down);
        let photo = testutil::compose(400, 300, &[(50, 60, &face)]);
        let identity = EnrolledIdentity::new(1, "Ada").with_sample(FaceSample::Image(Arc::new(photo)));
        let faces = extractor().extract(&identity);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].dimensions(), (100, 100));
    }

    #[test]
    fn test_extract_uses_largest_face() {
        let big = testutil::ramp_face(120, Ramp::Down);
        let small = testutil::ramp_face(60, Ramp::Right);
        let photo = testutil::compose(500, 300, &[(10, 10, &small), (200, 50, &big)]);
        let only_big = testutil::compose(500, 300, &[(200, 50, &big)]);

        let ex = extractor();
        let both = ex.extract(&EnrolledIdentity::new(1, "A").with_sample(FaceSample::Image(Arc::new(photo))));
        let single = ex.extract(&EnrolledIdentity::new(1, "A").with_sample(FaceSample::Image(Arc::new(only_big))));
        assert_eq!(both, single);
    }

    #[test]
    fn test_extract_skips_unusable_samples() {
        let blank = DynamicImage::ImageLuma8(GrayImage::new(200, 200));
        let good = CanonicalFace::from_preprocessed(testutil::noise_face(100, 100, 4));
        let wrong_size = CanonicalFace::from_preprocessed(testutil::noise_face(64, 64, 4));
        let identity = EnrolledIdentity::new(3, "Mixed")
            .with_sample(FaceSample::Image(Arc::new(blank)))
            .with_sample(FaceSample::Path(PathBuf::from("/nonexistent/face.png")))
            .with_sample(FaceSample::Canonical(wrong_size))
            .with_sample(FaceSample::Canonical(good.clone()));
        assert_eq!(extractor().extract(&identity), vec![good]);
    }

    #[test]
    fn test_extract_reads_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ada.png");
        let face = testutil::ramp_face(110, Ramp::Up);
        testutil::compose(300, 300, &[(100, 100, &face)]).save(&path).unwrap();
        let identity = EnrolledIdentity::new(1, "Ada").with_sample(FaceSample::Path(path));
        assert_eq!(extractor().extract(&identity).len(), 1);
    }

    #[test]
    fn test_no_face_yields_no_samples() {
        let blank = DynamicImage::ImageLuma8(GrayImage::new(200, 200));
        let identity = EnrolledIdentity::new(9, "Nobody").with_sample(FaceSample::Image(Arc::new(blank)));
        assert!(extractor().extract(&identity).is_empty());
    }
}
