//! infer-telemetry - detection with per-request performance logging
//!
//! Command-line shell around the detection pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use infer_telemetry::imaging::max_side;
use infer_telemetry::inference::{Detector, ReplayDetector};
use infer_telemetry::storage::{load_settings, save_settings, PipelineSettings};
use infer_telemetry::system::{capacity_mb, host_memory, Device, MetricsSampler};
use infer_telemetry::{round_to, DetectionPipeline, PipelineError};

#[derive(Parser)]
#[command(name = "infer-telemetry", version)]
#[command(about = "Object detection with adaptive input sizing and performance logging")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection on one or more images and append a log row for each
    Detect {
        /// Input images
        images: Vec<PathBuf>,

        /// Directory for annotated output images
        #[arg(short, long, default_value = "annotated")]
        output_dir: PathBuf,

        /// Performance log file (overrides settings)
        #[arg(long)]
        log_path: Option<PathBuf>,

        /// JSON file with detections to replay for every image
        #[arg(long)]
        detections: Option<PathBuf>,

        /// Model name recorded in the log (overrides settings)
        #[arg(long)]
        model: Option<String>,

        /// Run host-only even if an accelerator is present
        #[arg(long)]
        cpu: bool,
    },

    /// Print the effective settings as JSON
    Settings {
        /// Write them to the settings file
        #[arg(long)]
        save: bool,
    },

    /// Show the device, size policy, host memory and GPU metrics
    Probe {
        /// Ignore any accelerator
        #[arg(long)]
        cpu: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("infer_telemetry={}", cli.log_level)));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting infer-telemetry v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = load_settings();
    info!("Operating mode: {}", settings.mode);

    match cli.command {
        Commands::Detect {
            images,
            output_dir,
            log_path,
            detections,
            model,
            cpu,
        } => {
            if let Some(path) = log_path {
                settings.log_path = path;
            }
            if let Some(model) = model {
                settings.model_name = model;
            }
            settings.force_cpu |= cpu;
            settings.validate();

            run_detect(&settings, images, &output_dir, detections.as_deref()).await
        }
        Commands::Settings { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if save {
                save_settings(&settings).context("failed to save settings")?;
                info!("Settings saved");
            }
            Ok(())
        }
        Commands::Probe { cpu } => {
            settings.force_cpu |= cpu;
            run_probe(&settings);
            Ok(())
        }
    }
}

async fn run_detect(
    settings: &PipelineSettings,
    images: Vec<PathBuf>,
    output_dir: &Path,
    detections: Option<&Path>,
) -> Result<()> {
    let detector: Box<dyn Detector> = match detections {
        Some(path) => Box::new(
            ReplayDetector::from_file(&settings.model_name, path)
                .with_context(|| format!("failed to load detections from {}", path.display()))?,
        ),
        None => Box::new(ReplayDetector::empty(&settings.model_name)),
    };
    let pipeline = Arc::new(DetectionPipeline::from_settings(settings, detector));

    if images.is_empty() {
        if let Err(e) = pipeline.detect(None) {
            eprintln!("{}", e);
        }
        return Ok(());
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let tasks: Vec<_> = images
        .into_iter()
        .map(|path| {
            let pipeline = Arc::clone(&pipeline);
            let output_dir = output_dir.to_path_buf();
            tokio::task::spawn_blocking(move || process_image(&pipeline, &path, &output_dir))
        })
        .collect();

    let mut failures = 0usize;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{:#}", e);
                failures += 1;
            }
            Err(e) => {
                error!("Detection task panicked: {}", e);
                failures += 1;
            }
        }
    }

    info!("Performance log: {}", settings.log_path.display());
    if failures > 0 {
        anyhow::bail!("{} image(s) failed", failures);
    }
    Ok(())
}

fn process_image(pipeline: &DetectionPipeline, path: &Path, output_dir: &Path) -> Result<()> {
    let image = image::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let output = match pipeline.run(Some(image)) {
        Ok(output) => output,
        Err(e @ PipelineError::MissingImage) => {
            eprintln!("{}: {}", path.display(), e);
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("detection failed for {}", path.display())),
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let out_path = output_dir.join(format!("{}_annotated.png", stem));
    output
        .image
        .save(&out_path)
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    println!(
        "{} -> {} ({} detection(s), {} ms)",
        path.display(),
        out_path.display(),
        output.detections.len(),
        output
            .record
            .get("infer_ms")
            .map(|v| v.to_string())
            .unwrap_or_default()
    );
    Ok(())
}

fn run_probe(settings: &PipelineSettings) {
    let device = if settings.force_cpu {
        Device::Cpu
    } else {
        Device::auto()
    };
    let capacity = capacity_mb(&device);
    let ram = host_memory();
    let metrics = MetricsSampler::nvml().sample();

    println!("device:        {}", device.kind());
    match capacity {
        Some(mb) => println!("capacity:      {} MB", round_to(mb, 1)),
        None => println!("capacity:      n/a"),
    }
    println!("max side:      {}", max_side(capacity));
    println!(
        "host memory:   {} / {} MB",
        round_to(ram.used_mb, 1),
        round_to(ram.total_mb, 1)
    );
    for (name, value) in metrics.fields() {
        let shown = if value.is_absent() {
            "n/a".to_string()
        } else {
            value.to_string()
        };
        println!("{:<14} {}", format!("{}:", name), shown);
    }
    println!("log path:      {}", settings.log_path.display());
}
