mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facelookup_core::pipeline::RecognizeOptions;
use facelookup_core::{CascadeDetector, EngineConfig, FaceEngine};
use facelookup_store::{check_enrollment_image, load_image, ImageLimits, ManifestEnrollment};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facelookup", about = "Identify enrolled people in photos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize every face in an image and print the result as JSON
    Recognize {
        /// Image to analyse
        image: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Mode::Upload)]
        mode: Mode,
        /// Distance threshold (lower is stricter)
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Maximum number of faces to analyse
        #[arg(long)]
        max_faces: Option<usize>,
        /// Write the annotated image here (PNG)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build the model and show its status
    Status,
    /// List enrolled identities
    List,
    /// Check that a photo is usable for enrollment
    Check {
        /// Photo to check
        image: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Upload,
    Capture,
    Stream,
}

impl Mode {
    fn options(self) -> RecognizeOptions {
        match self {
            Mode::Upload => RecognizeOptions::upload(),
            Mode::Capture => RecognizeOptions::camera_capture(),
            Mode::Stream => RecognizeOptions::stream_frame(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();
    let engine_config =
        EngineConfig::load(config.engine_config.as_deref()).context("failed to load engine configuration")?;

    match cli.command {
        Commands::Recognize {
            image,
            mode,
            threshold,
            max_faces,
            output,
        } => {
            let engine = open_engine(&config, engine_config)?;
            let input = load_image(&image, &ImageLimits::default())
                .with_context(|| format!("cannot use {}", image.display()))?;

            let mut options = mode.options();
            if let Some(t) = threshold {
                options = options.with_threshold(t);
            }
            if let Some(n) = max_faces {
                options = options.with_max_faces(n);
            }
            options.annotate = options.annotate || output.is_some();

            let mut result = engine.recognize(&input, &options)?;
            // Printed JSON omits the base64 image.
            if let Some(annotated) = result.annotated_image.take() {
                if let Some(path) = &output {
                    annotated
                        .save(path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), "annotated image written");
                }
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => {
            let engine = open_engine(&config, engine_config)?;
            if let Err(e) = engine.rebuild_model() {
                tracing::error!(error = %e, "model rebuild failed");
            }
            println!("{}", serde_json::to_string_pretty(&engine.model_status())?);
        }
        Commands::List => {
            let manifest = ManifestEnrollment::new(&config.manifest_path);
            let identities = manifest.read()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            } else {
                println!("{}", serde_json::to_string_pretty(&identities)?);
            }
        }
        Commands::Check { image } => {
            let limits = ImageLimits::default();
            let input = load_image(&image, &limits).with_context(|| format!("cannot use {}", image.display()))?;
            let detector = CascadeDetector::load(&config.cascade_path(), &engine_config.detector)?;
            let face = check_enrollment_image(&input, &detector, &engine_config, &limits)
                .with_context(|| format!("{} is not usable for enrollment", image.display()))?;
            println!(
                "{}: face at {},{} size {}x{}",
                image.display(),
                face.x,
                face.y,
                face.width,
                face.height
            );
        }
    }

    Ok(())
}

fn open_engine(config: &config::Config, engine_config: EngineConfig) -> Result<FaceEngine> {
    let source = Arc::new(ManifestEnrollment::new(&config.manifest_path));
    FaceEngine::with_cascade(engine_config, &config.cascade_path(), source)
        .with_context(|| format!("failed to start engine (model dir {})", config.model_dir.display()))
}
