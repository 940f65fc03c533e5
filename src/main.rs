use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use panorama_stitch::capture::SyntheticRig;
use panorama_stitch::config::{JobDescriptor, PipelineConfig, SourceRef};
use panorama_stitch::core::device::{DeviceContext, DeviceId};
use panorama_stitch::jobs::{FileSystemEnvironment, JobQueue, JobState};
use panorama_stitch::{QualityFeed, quality_tap};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Dual-camera panorama stitching for whole-game recordings.
#[derive(Parser, Debug)]
#[command(name = "pano")]
#[command(about = "Stitch two synchronized camera recordings into one panorama")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more jobs to completion
    Run(RunArgs),
    /// Generate a synthetic rig: two image sequences, a calibration profile and a job file
    Synth(SynthArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job descriptor files (JSON)
    #[arg(required = true)]
    jobs: Vec<PathBuf>,

    /// Pipeline configuration (JSON); defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of calibration profiles
    #[arg(long, default_value = "calibration")]
    calibration_dir: PathBuf,

    /// Directory for job checkpoints
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Number of devices to schedule jobs on
    #[arg(short, long, default_value_t = 1)]
    devices: u32,

    /// Capture rate of sources that do not declare one
    #[arg(long, default_value_t = 30.0)]
    source_fps: f64,

    /// Resume every job after its last checkpoint
    #[arg(long)]
    resume: bool,

    /// Append per-frame quality events (JSON lines) to this file
    #[arg(long)]
    quality_log: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Output directory
    #[arg(short, long, default_value = "synthetic")]
    out: PathBuf,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 360)]
    height: u32,

    #[arg(long, default_value_t = 400)]
    frames: u64,

    #[arg(long, default_value_t = 40.0)]
    fps: f64,

    /// Fraction of each camera's width shared with the other camera
    #[arg(long, default_value_t = 0.2)]
    overlap: f64,

    /// Exposure gain of cam1 relative to cam0
    #[arg(long, default_value_t = 1.0)]
    right_gain: f64,

    /// Horizontal camera pan in pixels per frame
    #[arg(long, default_value_t = 0.5)]
    pan: f64,

    #[arg(long, default_value = "synthetic")]
    profile_id: String,
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Synth(args) => synth(args),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if args.devices == 0 {
        bail!("--devices must be at least 1");
    }
    let devices = (0..args.devices)
        .map(|i| DeviceContext::new(DeviceId(i)))
        .collect::<Result<Vec<_>, _>>()?;
    let env = Arc::new(FileSystemEnvironment::new(
        &args.calibration_dir,
        &args.checkpoint_dir,
        args.source_fps,
    ));
    let (queue, quality_writer) = match &args.quality_log {
        Some(path) => {
            let (tap, feed) = quality_tap(config.quality_tap_depth);
            let writer = spawn_quality_writer(path, feed)?;
            (JobQueue::start_with_tap(env, config, devices, Some(tap))?, Some(writer))
        }
        None => (JobQueue::start(env, config, devices)?, None),
    };

    let mut ids = Vec::with_capacity(args.jobs.len());
    for path in &args.jobs {
        let mut job = JobDescriptor::from_json_file(path).with_context(|| format!("loading job {}", path.display()))?;
        job.resume |= args.resume;
        ids.push(queue.submit(job)?);
    }

    let mut failed = 0usize;
    for id in ids {
        let status = queue.wait(id).await?;
        if status.state != JobState::Completed {
            failed += 1;
            warn!(job_id = %id, job = %status.name, failure = ?status.failure, "job did not complete");
        }
        println!("{}", serde_json::to_string(&status)?);
    }
    queue.shutdown().await;

    // The feed closes once the queue has dropped its tap.
    if let Some(writer) = quality_writer {
        let overflowed = tokio::task::spawn_blocking(move || writer.join())
            .await?
            .map_err(|_| anyhow::anyhow!("quality log writer panicked"))??;
        if overflowed > 0 {
            warn!(overflowed, "quality log fell behind; events were discarded");
        }
    }

    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}

fn spawn_quality_writer(path: &Path, feed: QualityFeed) -> Result<JoinHandle<Result<u64>>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening quality log {}", path.display()))?;
    let handle = std::thread::Builder::new()
        .name("quality-log".into())
        .spawn(move || {
            let mut out = BufWriter::new(file);
            while let Some(event) = feed.next_event() {
                serde_json::to_writer(&mut out, &event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(feed.overflowed())
        })?;
    Ok(handle)
}

fn synth(args: SynthArgs) -> Result<()> {
    let rig = SyntheticRig::new(args.width, args.height)
        .profile_id(args.profile_id.clone())
        .overlap_fraction(args.overlap)
        .fps(args.fps)
        .frames(args.frames)
        .pan(args.pan)
        .right_gain(args.right_gain);
    let layout = rig.write_to(&args.out)?;

    let job = JobDescriptor {
        name: "synthetic".to_string(),
        left_source: SourceRef {
            path: layout.left,
            fps: Some(args.fps),
        },
        right_source: SourceRef {
            path: layout.right,
            fps: Some(args.fps),
        },
        calibration_profile: args.profile_id,
        output: args.out.join("output"),
        resume: false,
    };
    let job_path = args.out.join("job.json");
    std::fs::write(&job_path, serde_json::to_string_pretty(&job)?)
        .with_context(|| format!("writing {}", job_path.display()))?;
    info!(
        job = %job_path.display(),
        calibration_dir = %layout.calibration_dir.display(),
        "synthetic rig ready"
    );
    Ok(())
}
