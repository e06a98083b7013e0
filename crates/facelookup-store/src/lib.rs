//! facelookup-store: Enrollment backed by files on disk.
//!
//! A TOML manifest lists identities and their photos; `images` checks
//! uploads before they are enrolled or recognized.

pub mod images;
pub mod manifest;

pub use images::{check_enrollment_image, load_image, ImageLimits, ImageLoadError};
pub use manifest::{ManifestEnrollment, ManifestError, ManifestIdentity};
