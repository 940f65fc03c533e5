//! # Configuration Module
//!
//! Pipeline tuning and job descriptors, both loaded from JSON.

#[allow(clippy::module_inception)]
pub mod config;
pub mod job;

pub use config::{AlignmentConfig, ColorConfig, PipelineConfig};
pub use job::{JobDescriptor, SourceRef};
