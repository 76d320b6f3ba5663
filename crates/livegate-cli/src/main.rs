use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use livegate_core::crop::extract_crop;
use livegate_core::{DetectorConfig, FaceDetection, Status};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

#[derive(Parser)]
#[command(name = "livegate", about = "Dual-model face anti-spoofing")]
struct Cli {
    /// TOML config file (default: $LIVEGATE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the anti-spoofing pipeline on a frame and print JSON results
    Check {
        /// Frame to analyse
        #[arg(long)]
        image: PathBuf,
        /// JSON array of face detections ({"bbox": ..., "track_id": ...})
        #[arg(long)]
        detections: PathBuf,
        /// Number of passes over the same frame; only the last is printed
        #[arg(long, default_value_t = 1)]
        frames: usize,
    },
    /// Write the texture and shape crops of each detection as PNG
    Crops {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        detections: PathBuf,
        /// Output directory
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the detector configuration and model summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Check {
            image,
            detections,
            frames,
        } => {
            let frame = read_image(&image)?;
            let detections = read_detections(&detections)?;
            let handle = engine::spawn_engine(config).context("starting anti-spoofing engine")?;

            let mut last = Vec::new();
            for pass in 1..=frames.max(1) {
                last = handle.check(frame.clone(), detections.clone()).await?;
                let live = last.iter().filter(|r| r.antispoofing.status == Status::Real).count();
                tracing::info!(pass, faces = last.len(), live, "check pass complete");
            }
            println!("{}", serde_json::to_string_pretty(&last)?);
        }
        Commands::Crops {
            image,
            detections,
            out,
        } => {
            let frame = read_image(&image)?;
            let detections = read_detections(&detections)?;
            let report = write_crops(&config, &frame, &detections, &out)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Info => {
            let handle = engine::spawn_engine(config).context("starting anti-spoofing engine")?;
            let info = handle.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

/// Decode a frame. Channel order is normalised to RGB here, once.
fn read_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).with_context(|| format!("opening image {}", path.display()))?;
    Ok(img.to_rgb8())
}

fn read_detections(path: &Path) -> Result<Vec<FaceDetection>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading detections {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing detections {}", path.display()))
}

#[derive(Debug, Serialize)]
struct CropReport {
    face_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    texture: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<String>,
}

/// Write the crops the models would see, after scale separation.
fn write_crops(
    config: &DetectorConfig,
    frame: &RgbImage,
    detections: &[FaceDetection],
    out: &Path,
) -> Result<Vec<CropReport>> {
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let (frame, scaled) = config.scale_separation.ensure_separation(frame, detections);

    let mut report = Vec::with_capacity(scaled.len());
    for (face_id, face) in scaled.iter().enumerate() {
        let mut entry = CropReport {
            face_id,
            texture: None,
            shape: None,
            skipped: None,
        };

        let bbox = match &face.bbox {
            Ok(bbox) => bbox,
            Err(e) => {
                entry.skipped = Some(e.to_string());
                report.push(entry);
                continue;
            }
        };

        for (scale, name) in [(config.texture_scale, "texture"), (config.shape_scale, "shape")] {
            let Some(crop) = extract_crop(&frame, bbox, scale) else {
                entry.skipped = Some(format!("{name} crop below minimum size"));
                continue;
            };
            let path = out.join(format!("face_{face_id}_{name}.png"));
            crop.save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::debug!(face = face_id, scale, width = crop.width(), height = crop.height(), "crop written");
            if name == "texture" {
                entry.texture = Some(path);
            } else {
                entry.shape = Some(path);
            }
        }
        report.push(entry);
    }

    Ok(report)
}
