use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Directory holding the Haar cascade.
    pub model_dir: PathBuf,
    /// Path to the identity manifest.
    pub manifest_path: PathBuf,
    /// Optional engine configuration file.
    pub engine_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `FACELOOKUP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACELOOKUP_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facelookup_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facelookup");

        let manifest_path = std::env::var("FACELOOKUP_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("people.toml"));

        Self {
            model_dir,
            manifest_path,
            engine_config: std::env::var("FACELOOKUP_CONFIG").ok().map(PathBuf::from),
        }
    }

    /// Path to the frontal-face cascade.
    pub fn cascade_path(&self) -> PathBuf {
        self.model_dir.join("haarcascade_frontalface.json")
    }
}
