use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::index::cache;
use faceid_core::session::{CancelFlag, Progress};
use faceid_core::{IndexStore, EMBEDDING_DIM};
use faceid_hw::{FrameSource, V4lOpener};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::EngineHandle;

#[derive(Parser)]
#[command(name = "faceid", about = "Face identity enrollment and recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person by sampling their face from the camera
    Enroll {
        /// Identity name (also the directory name for saved crops)
        name: String,
        /// Number of face samples to capture
        #[arg(long)]
        frames: Option<usize>,
    },
    /// Identify the person in front of the camera
    Recognize {
        /// Number of face samples to vote over
        #[arg(long)]
        samples: Option<usize>,
        /// Minimum cosine similarity for a vote
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Reload the index from its cache, or rescan the face directories
    Rebuild {
        /// Ignore the cache and rescan the face directories
        #[arg(long)]
        force: bool,
    },
    /// List enrolled identities
    List,
    /// Watch the camera feed and report frame rate and brightness
    Preview {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Show configuration and index status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { name, frames } => {
            let handle = start_engine(&config).await?;
            let source = start_camera(&config)?;
            let mut params = config.enrollment_params();
            if let Some(frames) = frames {
                params.capture_target = frames;
            }

            let cancel = CancelFlag::new();
            let (progress, printer) = progress_printer();
            let result =
                until_interrupted(handle.enroll(source, &name, params, cancel.clone(), Some(progress)), &cancel).await;
            let _ = printer.await;

            match result {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("enrollment failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Recognize { samples, threshold } => {
            let handle = start_engine(&config).await?;
            let source = start_camera(&config)?;
            let mut params = config.recognition_params();
            if let Some(samples) = samples {
                params.sample_count = samples;
            }
            if let Some(threshold) = threshold {
                params.similarity_threshold = threshold;
            }

            let cancel = CancelFlag::new();
            let (progress, printer) = progress_printer();
            let verdict =
                until_interrupted(handle.recognize(source, params, cancel.clone(), Some(progress)), &cancel).await?;
            let _ = printer.await;

            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(if verdict.is_match() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Rebuild { force } => {
            let handle = start_engine(&config).await?;
            let source = handle.rebuild(force).await?;
            println!("{}", serde_json::to_string_pretty(&source)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let handle = start_engine(&config).await?;
            println!("{}", serde_json::to_string_pretty(&handle.index().identities())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Preview { seconds } => {
            preview(&config, Duration::from_secs(seconds)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            status(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Spawn the engine and load the index, from cache when possible.
async fn start_engine(config: &Config) -> Result<EngineHandle> {
    let index = Arc::new(IndexStore::new(&config.data_dir, &config.model_name, EMBEDDING_DIM));
    let handle = engine::spawn_engine(config, index).context("failed to start engine")?;
    let source = handle.rebuild(false).await.context("failed to load identity index")?;
    tracing::debug!(?source, "index ready");
    Ok(handle)
}

fn start_camera(config: &Config) -> Result<Arc<FrameSource>> {
    let opener = V4lOpener {
        device_path: config.camera_device.clone(),
        width: config.capture_width,
        height: config.capture_height,
    };
    let source = FrameSource::start(opener, config.source_config()).context("failed to start capture thread")?;
    Ok(Arc::new(source))
}

/// Print session progress to stderr until the sender side is dropped.
fn progress_printer() -> (mpsc::UnboundedSender<Progress>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            let flag = if p.error { " (failed)" } else { "" };
            eprintln!("[{}] {}/{}{flag}", p.phase.label(), p.count, p.target);
        }
    });
    (tx, printer)
}

/// Await `fut`, raising `cancel` on Ctrl-C and then waiting for the session
/// to wind down.
async fn until_interrupted<F: Future>(fut: F, cancel: &CancelFlag) -> F::Output {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return out,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; cancelling session");
            cancel.cancel();
        }
    }
    fut.await
}

async fn preview(config: &Config, duration: Duration) -> Result<()> {
    let source = start_camera(config)?;
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut last_sequence = None;
    let mut distinct = 0u64;

    while started.elapsed() < duration {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let Some(frame) = source.latest_frame() else {
            continue;
        };
        if last_sequence != Some(frame.sequence) {
            last_sequence = Some(frame.sequence);
            distinct += 1;
            eprintln!(
                "frame {} {}x{} brightness {:.1}",
                frame.sequence,
                frame.width(),
                frame.height(),
                frame.avg_brightness()
            );
        }
    }

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let stats = source.stats();
    let report = serde_json::json!({
        "seconds": elapsed,
        "frames_seen": distinct,
        "frames_captured": stats.frames_captured,
        "capture_fps": stats.frames_captured as f64 / elapsed,
        "read_failures": stats.read_failures,
        "open_failures": stats.open_failures,
        "reopens": stats.reopens,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let cache_path = IndexStore::cache_path_for(&config.data_dir, &config.model_name);
    let cache = match cache::load(&cache_path, &config.model_name) {
        Ok(index) => serde_json::json!({
            "slots": index.len(),
            "identities": index.identity_count(),
        }),
        Err(e) if e.is_missing() => serde_json::Value::Null,
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };

    let report = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "config": config,
        "cache_path": cache_path,
        "cache": cache,
        "detector_model_present": config.detector_model_path().exists(),
        "embedder_model_present": config.embedder_model_path().exists(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
