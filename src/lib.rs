//! # Panorama Stitch Library
//!
//! A dual-camera panorama stitching engine for whole-game sports recordings. Two
//! wide-angle cameras film a field side by side; every synchronized frame pair is
//! undistorted, color-matched, aligned at the seam, blended into one panorama and
//! handed to an encoder.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `capture`: Frame sources (image sequences, a synthetic test rig) and pairing
//! - `processing`: The four pipeline stages and their shared abstractions
//! - `core`: Device contexts, pooled device memory, frames and stage queues
//! - `calibration`: Per-rig lens and geometry profiles
//! - `config`: Pipeline tuning and job descriptors
//! - `session`: One job's frames through the stage graph
//! - `jobs`: The batch queue, job environments and checkpoints
//! - `quality`: Per-frame quality annotations for monitoring
//!
//! ## Features
//!
//! - **Bounded memory**: every buffer comes from a capped pool and returns to it
//!   only after the device work reading it has completed
//! - **Backpressure**: bounded queues between stages, paced admission
//! - **Temporal smoothing**: color and seam alignment adapt slowly, drift beyond a
//!   threshold falls back to calibration
//! - **Resumable jobs**: checkpoints restore the smoothed state, so a resumed job
//!   reproduces the uninterrupted output byte for byte
//!
//! ## Example
//!
//! ```rust,no_run
//! use panorama_stitch::config::{JobDescriptor, PipelineConfig, SourceRef};
//! use panorama_stitch::core::device::{DeviceContext, DeviceId};
//! use panorama_stitch::jobs::{FileSystemEnvironment, JobQueue};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Arc::new(FileSystemEnvironment::new("calibration", "checkpoints", 30.0));
//! let queue = JobQueue::start(env, PipelineConfig::default(), vec![DeviceContext::new(DeviceId(0))?])?;
//!
//! let id = queue.submit(JobDescriptor {
//!     name: "final-2026".to_string(),
//!     left_source: SourceRef::new("recordings/cam0"),
//!     right_source: SourceRef::new("recordings/cam1"),
//!     calibration_profile: "stadium-north".to_string(),
//!     output: "out/final-2026".into(),
//!     resume: true,
//! })?;
//! let status = queue.wait(id).await?;
//! println!("{id}: {}", status.state);
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod processing;
pub mod quality;
pub mod session;

/// Re-export error types for convenience
pub use error::{
    ErrorSeverity, HasRecoverySuggestion, HasSeverity, Recoverable, RecoveryStrategy, Retryable, StitchError,
    StitchResult,
};

pub use calibration::{CalibrationProfile, CalibrationStore};
pub use config::{JobDescriptor, PipelineConfig, SourceRef};
pub use jobs::{Checkpoint, CheckpointStore, FileSystemEnvironment, JobEnvironment, JobId, JobQueue, JobState, JobStatus};
pub use quality::{QualityEvent, QualityFeed, QualityTap, quality_tap};
pub use session::{PipelineSession, PipelineSessionBuilder, SessionReport};
