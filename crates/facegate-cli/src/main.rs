use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    Config, CosineMatcher, FaceDb, FaceDetector, FaceEncoder, FaceNetEncoder, Matcher,
    UltraFaceDetector, FACENET_MODEL_VERSION,
};
use facegate_hw::{Camera, FrameSource};
use image::RgbImage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate identity administration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a reference embedding for an identity
    Enroll {
        /// Identity label (e.g., a student number)
        #[arg(short, long)]
        label: String,
        /// Read the face from an image file instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Remove every reference embedding of an identity
    Remove {
        /// Identity label to remove
        label: String,
    },
    /// Match the faces in an image against enrolled identities (no dispatch)
    Identify {
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Show effective configuration and store size
    Status,
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { label, image } => {
            let frame = match image {
                Some(path) => load_image(&path)?,
                None => capture_from_camera(&config)?,
            };
            let (mut detector, mut encoder) = load_models(&config)?;

            let faces = detector.detect(&frame)?;
            let Some(face) = faces
                .into_iter()
                .find(|f| f.confidence >= config.confidence_threshold)
            else {
                bail!(
                    "no face with confidence >= {} found",
                    config.confidence_threshold
                );
            };

            let embedding = encoder.encode(&frame, &face)?;
            let db = open_db(&config)?;
            let id = db.enroll(&label, &embedding)?;
            println!(
                "Enrolled {label} (id {id}, confidence {:.3}, dim {})",
                face.confidence,
                embedding.dim()
            );
        }
        Commands::List => {
            let identities = open_db(&config)?.list()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}\t{} embedding(s)\tenrolled {}",
                    identity.label, identity.embeddings, identity.first_enrolled_at
                );
            }
        }
        Commands::Remove { label } => {
            let removed = open_db(&config)?.remove(&label)?;
            if removed == 0 {
                bail!("no identity labelled {label}");
            }
            println!("Removed {removed} embedding(s) for {label}");
        }
        Commands::Identify { image } => {
            let frame = load_image(&image)?;
            let store = open_db(&config)?.load(FACENET_MODEL_VERSION)?;
            let (mut detector, mut encoder) = load_models(&config)?;

            let faces: Vec<_> = detector
                .detect(&frame)?
                .into_iter()
                .filter(|f| f.confidence >= config.confidence_threshold)
                .collect();
            if faces.is_empty() {
                println!("No faces found");
            }
            for face in faces {
                let embedding = encoder.encode(&frame, &face)?;
                let result = CosineMatcher.compare(
                    &embedding,
                    store.references(),
                    config.recognition_threshold,
                );
                println!(
                    "[{:.0},{:.0} {:.0}x{:.0}] {} ({:.2})",
                    face.x,
                    face.y,
                    face.width,
                    face.height,
                    result.display_label(),
                    result.distance
                );
            }
        }
        Commands::Status => {
            let references = open_db(&config)?.load(FACENET_MODEL_VERSION)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "api_url": config.api_url,
                    "camera": config.camera_device,
                    "db_path": config.db_path,
                    "identities": references.labels().len(),
                    "references": references.len(),
                    "foreign_references":
                        references.foreign_references(FACENET_MODEL_VERSION).len(),
                    "cooldown_secs": config.cooldown_secs,
                    "recognition_threshold": config.recognition_threshold,
                    "confidence_threshold": config.confidence_threshold,
                    "detector_model": config.detector_model_path(),
                    "encoder_model": config.encoder_model_path(),
                }))?
            );
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}\t{}\t{} ({})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

fn open_db(config: &Config) -> Result<FaceDb> {
    FaceDb::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

fn load_models(config: &Config) -> Result<(UltraFaceDetector, FaceNetEncoder)> {
    let detector = UltraFaceDetector::load(&config.detector_model_path())?;
    let encoder = FaceNetEncoder::load(&config.encoder_model_path(), config.encoder_input_size)?;
    Ok((detector, encoder))
}

fn load_image(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8())
}

fn capture_from_camera(config: &Config) -> Result<RgbImage> {
    let camera = Camera::open(&config.camera_device)?;
    let mut stream = camera.stream()?;
    stream.warm_up(config.warmup_frames);
    let frame = stream.next_frame()?;
    Ok(frame.image)
}
