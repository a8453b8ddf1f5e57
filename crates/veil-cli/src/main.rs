use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use veil_core::{preprocess, AdaptiveThreshold, EnsembleDetector, IdentitySet, PreprocessParams, ReferenceIdentity};
use veil_engine::{
    ChannelSink, Config, Engine, FsImageLoader, ImageRef, IntrinsicSize, Pipeline, Rect, ReferenceStore,
    TriageScheduler, Viewport,
};

mod backends;
mod refs;

use refs::JsonReferenceStore;

/// Vertical gap between images stacked in the scan document.
const SCAN_GAP_PX: f64 = 16.0;

#[derive(Parser)]
#[command(name = "veil", about = "Face-based image blocking")]
struct Cli {
    /// TOML configuration file; `VEIL_*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build reference embeddings from a directory of photos
    Enroll {
        /// One subdirectory per identity, named after its label
        #[arg(long)]
        photos: PathBuf,
        /// Output JSON file
        #[arg(long)]
        out: PathBuf,
    },
    /// Show the adaptive threshold of every enrolled identity
    Thresholds {
        #[arg(long)]
        refs: PathBuf,
    },
    /// Triage images and print one JSON line per outcome
    Scan {
        #[arg(long)]
        refs: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Enroll { photos, out } => enroll(config, &photos, &out).await,
        Commands::Thresholds { refs } => thresholds(&config, &refs).await,
        Commands::Scan { refs, images } => scan(config, &refs, images).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn enroll(config: Config, photos: &Path, out: &Path) -> Result<()> {
    let registry = backends::start(&config).await?;
    let ready = registry
        .acquire(&config.ensemble_backends, config.backend_ready_timeout())
        .await?;
    let detector = EnsembleDetector::new(ready, config.ensemble_params());
    let params = config.preprocess;
    let photos = photos.to_path_buf();

    let references = tokio::task::spawn_blocking(move || enroll_photos(&photos, &detector, &params)).await??;
    if references.is_empty() {
        bail!("no faces enrolled");
    }
    refs::save(out, &references)?;

    let set = IdentitySet::build(references, &config.threshold_params());
    for identity in set.iter() {
        tracing::info!(
            label = identity.label(),
            samples = identity.embeddings().len(),
            threshold = identity.threshold().value,
            "identity enrolled"
        );
    }
    println!("enrolled {} identities into {}", set.len(), out.display());
    Ok(())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// The highest-confidence face of each photo becomes one reference embedding.
fn enroll_photos(
    photos: &Path,
    detector: &EnsembleDetector,
    params: &PreprocessParams,
) -> Result<Vec<ReferenceIdentity>> {
    let mut references = Vec::new();
    for dir in sorted_entries(photos)?.into_iter().filter(|p| p.is_dir()) {
        let Some(label) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mut embeddings = Vec::new();
        for photo in sorted_entries(&dir)?.into_iter().filter(|p| p.is_file()) {
            let image = match image::open(&photo) {
                Ok(image) => image.to_rgb8(),
                Err(err) => {
                    tracing::warn!(photo = %photo.display(), error = %err, "skipping unreadable photo");
                    continue;
                }
            };
            let detections = detector.detect(&preprocess(&image, params))?;
            let best = detections
                .into_iter()
                .filter(|d| d.embedding.is_some())
                .max_by(|a, b| a.confidence().total_cmp(&b.confidence()));
            match best.and_then(|d| d.embedding) {
                Some(embedding) => embeddings.push(embedding),
                None => tracing::warn!(photo = %photo.display(), "no face found"),
            }
        }
        if embeddings.is_empty() {
            tracing::warn!(label = %label, "no usable photos; identity skipped");
            continue;
        }
        references.push(ReferenceIdentity { label, embeddings });
    }
    Ok(references)
}

#[derive(Serialize)]
struct ThresholdReport<'a> {
    label: &'a str,
    samples: usize,
    #[serde(flatten)]
    threshold: &'a AdaptiveThreshold,
}

async fn thresholds(config: &Config, refs: &Path) -> Result<()> {
    let references = JsonReferenceStore::new(refs).load().await?;
    let set = IdentitySet::build(references, &config.threshold_params());
    for identity in set.iter() {
        let report = ThresholdReport {
            label: identity.label(),
            samples: identity.embeddings().len(),
            threshold: identity.threshold(),
        };
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

async fn scan(config: Config, refs: &Path, images: Vec<PathBuf>) -> Result<()> {
    let store = JsonReferenceStore::new(refs);
    let engine = Engine::new(config.clone(), Vec::new())?;
    let identities = engine.reload_references(&store).await?;
    tracing::info!(identities, images = images.len(), "scan starting");

    let registry = backends::start_for_scan(&config).await?;
    let pipeline = Arc::new(Pipeline::new(engine.clone(), registry, Arc::new(FsImageLoader)));
    let (sink, mut events) = ChannelSink::new();
    let scheduler = TriageScheduler::new(engine, pipeline, Arc::new(sink), Viewport::default())?;

    // Lay the images out top to bottom, as a long page would.
    let mut y = 0.0;
    for (index, path) in images.iter().enumerate() {
        let src = path.to_string_lossy().into_owned();
        let mut image = ImageRef::new(format!("img-{index}"), src.clone());
        match tokio::fs::read(path).await {
            Ok(bytes) => image = image.with_digest(format!("{:x}", Sha256::digest(&bytes))),
            Err(err) => tracing::warn!(src = %src, error = %err, "cannot read image"),
        }
        let (width, height) = image::image_dimensions(path).unwrap_or((0, 0));
        let rect = Rect::new(0.0, y, width as f64, height as f64);
        y += height as f64 + SCAN_GAP_PX;
        scheduler.enqueue_image(image, rect, IntrinsicSize::new(width, height));
    }

    scheduler.wait_idle().await;
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }

    let stats = scheduler.stats();
    tracing::info!(done = stats.done, failed = stats.failed, "scan finished");
    Ok(())
}
