//! Identity directory kept as a TOML manifest.
//!
//! ```toml
//! [[identity]]
//! id = 1
//! name = "Ada Lovelace"
//! images = ["faces/ada.jpg"]
//!
//! [identity.metadata]
//! employee_id = "EMP001"
//! department = "Engineering"
//! ```
//!
//! Image paths are relative to the manifest's directory. The file is re-read
//! on every listing, so edits take effect after the engine is notified.

use facelookup_core::enrollment::{EnrolledIdentity, EnrollmentError, EnrollmentSource, FaceSample};
use facelookup_core::{IdentityId, IdentityMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("identity {id}: {message}")]
    Invalid { id: i64, message: String },
    #[error("identity id {0} appears more than once")]
    DuplicateId(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestIdentity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub images: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: IdentityMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default, rename = "identity")]
    identities: Vec<ManifestIdentity>,
}

pub struct ManifestEnrollment {
    path: PathBuf,
}

impl ManifestEnrollment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse and validate the manifest. Image paths come back resolved.
    pub fn read(&self) -> Result<Vec<ManifestIdentity>, ManifestError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;
        let file: ManifestFile = toml::from_str(&text).map_err(|source| ManifestError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let base = self.path.parent().unwrap_or(Path::new("."));
        let mut seen = HashSet::new();
        let mut identities = Vec::with_capacity(file.identities.len());
        for mut identity in file.identities {
            if !seen.insert(identity.id) {
                return Err(ManifestError::DuplicateId(identity.id));
            }
            validate_identity(&identity).map_err(|message| ManifestError::Invalid {
                id: identity.id,
                message,
            })?;
            identity.name = identity.name.trim().to_string();
            identity.images = identity.images.iter().map(|p| base.join(p)).collect();
            identities.push(identity);
        }
        tracing::debug!(path = %self.path.display(), identities = identities.len(), "manifest read");
        Ok(identities)
    }
}

impl EnrollmentSource for ManifestEnrollment {
    fn list_identities(&self) -> Result<Vec<EnrolledIdentity>, EnrollmentError> {
        let identities = self.read().map_err(|e| match e {
            ManifestError::Io { path, source } => EnrollmentError::Io { path, source },
            other => EnrollmentError::Invalid(other.to_string()),
        })?;
        Ok(identities
            .into_iter()
            .map(|m| EnrolledIdentity {
                id: IdentityId(m.id),
                name: m.name,
                metadata: m.metadata,
                samples: m.images.into_iter().map(FaceSample::Path).collect(),
            })
            .collect())
    }
}

/// Field rules for a directory entry.
pub fn validate_identity(identity: &ManifestIdentity) -> Result<(), String> {
    let name = identity.name.trim();
    let name_len = name.chars().count();
    if name_len < 2 {
        return Err("name must be at least 2 characters long".into());
    }
    if name_len > 100 {
        return Err("name must be at most 100 characters long".into());
    }
    if identity.images.is_empty() {
        return Err("at least one image is required".into());
    }

    let meta = &identity.metadata;
    if let Some(emp) = &meta.employee_id {
        if emp.trim().chars().count() > 50 {
            return Err("employee id must be at most 50 characters long".into());
        }
    }
    if let Some(email) = meta.email.as_deref().filter(|e| !e.is_empty()) {
        if !is_email(email) {
            return Err(format!("invalid email {email:?}"));
        }
    }
    if let Some(phone) = meta.phone.as_deref().filter(|p| !p.is_empty()) {
        if phone.chars().filter(char::is_ascii_digit).count() < 10 {
            return Err("phone number must contain at least 10 digits".into());
        }
    }
    Ok(())
}

/// `local@domain.tld` with a purely alphabetic TLD of two or more letters.
fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty() && host.chars().all(|c| c.is_ascii_alphanumeric() || ".-".contains(c));
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    local_ok && host_ok && tld_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("people.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn entry(name: &str) -> ManifestIdentity {
        ManifestIdentity {
            id: 1,
            name: name.into(),
            images: vec![PathBuf::from("a.jpg")],
            metadata: IdentityMetadata::default(),
        }
    }

    #[test]
    fn test_read_resolves_paths_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
[[identity]]
id = 1
name = "  Ada Lovelace "
images = ["faces/ada.jpg", "faces/ada2.jpg"]

[identity.metadata]
employee_id = "EMP001"
department = "Engineering"
email = "ada@example.com"

[[identity]]
id = 2
name = "Grace Hopper"
images = ["grace.png"]
"#,
        );
        let identities = ManifestEnrollment::new(&path).read().unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].name, "Ada Lovelace");
        assert_eq!(identities[0].images[0], dir.path().join("faces/ada.jpg"));
        assert_eq!(identities[0].metadata.department.as_deref(), Some("Engineering"));
        assert_eq!(identities[1].metadata, IdentityMetadata::default());
    }

    #[test]
    fn test_list_identities_uses_path_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "[[identity]]\nid = 5\nname = \"Ada\"\nimages = [\"a.jpg\"]\n");
        let listed = ManifestEnrollment::new(&path).list_identities().unwrap();
        assert_eq!(listed[0].id, IdentityId(5));
        assert!(matches!(&listed[0].samples[0], FaceSample::Path(p) if p.ends_with("a.jpg")));
    }

    #[test]
    fn test_manifest_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "");
        let source = ManifestEnrollment::new(&path);
        assert!(source.list_identities().unwrap().is_empty());
        write_manifest(dir.path(), "[[identity]]\nid = 1\nname = \"Ada\"\nimages = [\"a.jpg\"]\n");
        assert_eq!(source.list_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = "[[identity]]\nid = 1\nname = \"Ada\"\nimages = [\"a.jpg\"]\n\n\
                    [[identity]]\nid = 1\nname = \"Bob\"\nimages = [\"b.jpg\"]\n";
        let path = write_manifest(dir.path(), body);
        let err = ManifestEnrollment::new(&path).read().unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateId(1)));
    }

    #[test]
    fn test_missing_manifest_is_io_error() {
        let source = ManifestEnrollment::new("/nonexistent/people.toml");
        assert!(matches!(source.read(), Err(ManifestError::Io { .. })));
        assert!(matches!(source.list_identities(), Err(EnrollmentError::Io { .. })));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "[[identity]]\nid = \"one\"\n");
        assert!(matches!(ManifestEnrollment::new(&path).read(), Err(ManifestError::Parse { .. })));
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_identity(&entry("Al")).is_ok());
        assert!(validate_identity(&entry(" A ")).is_err());
        assert!(validate_identity(&entry(&"x".repeat(101))).is_err());
        let mut no_images = entry("Ada");
        no_images.images.clear();
        assert!(validate_identity(&no_images).is_err());
    }

    #[test]
    fn test_metadata_rules() {
        let mut e = entry("Ada");
        e.metadata.employee_id = Some("E".repeat(51));
        assert!(validate_identity(&e).is_err());

        let mut e = entry("Ada");
        e.metadata.phone = Some("+1-555-0123".into());
        assert!(validate_identity(&e).is_err());
        e.metadata.phone = Some("+1 (555) 012-3456".into());
        assert!(validate_identity(&e).is_ok());

        let mut e = entry("Ada");
        e.metadata.email = Some("ada@example".into());
        assert!(validate_identity(&e).is_err());
        e.metadata.email = Some("ada.l+work@mail.example.com".into());
        assert!(validate_identity(&e).is_ok());
    }

    #[test]
    fn test_email_shapes() {
        assert!(is_email("john.doe@company.com"));
        assert!(!is_email("john.doe@company.c"));
        assert!(!is_email("@company.com"));
        assert!(!is_email("john doe@company.com"));
        assert!(!is_email("john.doe"));
    }
}
