//! # Jobs Module
//!
//! Whole-game jobs: the queue that schedules them onto devices, the environment that
//! resolves their inputs, and the checkpoints that let a failed job resume.

pub mod checkpoint;
pub mod environment;
pub mod job;
pub mod queue;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use environment::{FileSystemEnvironment, JobEnvironment};
pub use job::{CANCELLED, JobId, JobState, JobStatus};
pub use queue::JobQueue;
