//! # Error Handling for the Stitching Engine
//!
//! Errors carry context, metadata and a recovery hint, and are classified so
//! that every layer of the engine reacts the same way to the same failure.
//!
//! ## Error Classes
//!
//! Every [`StitchError`] maps to one [`classify::ErrorClass`]:
//!
//! - **Transient**: frame-level faults (decode glitch, kernel fault, buffer or handoff
//!   timeout). Retried up to the configured bound, then the frame is dropped with a
//!   missing marker where that is allowed.
//! - **SyncRejection**: a frame pair whose capture timestamps are too far apart. Treated
//!   like a transient fault; escalates when it keeps recurring.
//! - **JobFatal**: calibration mismatch, pool cap exceeded, stale buffer handle,
//!   corrupt checkpoint, encoder failure. The job stops and is reported failed.
//!
//! Degraded output (drift fallback, stale color estimate) is not an error at all: the
//! frame is delivered and carries a degraded flag.
//!
//! ## Usage
//!
//! ```rust
//! use panorama_stitch::error::{classify, Retryable, StitchError};
//!
//! let error = StitchError::kernel("undistort", "device fault")
//!     .with_metadata("frame_index", "42")
//!     .with_recovery_suggestion("check device health if this keeps happening");
//!
//! assert!(error.is_retryable());
//! assert_eq!(classify::class_of(&error), classify::ErrorClass::Transient);
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

/// Operation names that change how a timeout is handled.
pub mod operations {
    /// Waiting for a free buffer in a size-class pool.
    pub const BUFFER_ACQUIRE: &str = "buffer_acquire";
    /// Handing a finished panorama to the encoder queue.
    pub const ENCODER_HANDOFF: &str = "encoder_handoff";
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ErrorSeverity {
    /// Confined to one frame
    #[default]
    Frame,
    /// Ends the job
    Fatal,
}

/// Annotations attached while an error travels up the pipeline
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub context: Option<String>,
    pub recovery_suggestion: Option<String>,
    pub severity: ErrorSeverity,
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn fatal() -> Self {
        Self {
            severity: ErrorSeverity::Fatal,
            ..Self::default()
        }
    }
}

/// Every failure the engine reports
#[derive(Debug)]
pub enum StitchError {
    /// A configuration value out of range
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// Calibration profile missing, malformed or not matching the sources
    Calibration {
        profile: String,
        reason: String,
        context: ErrorContext,
    },
    /// Checkpoint unreadable or failing its integrity check
    Checkpoint {
        job: String,
        reason: String,
        context: ErrorContext,
    },
    /// A camera source failed to deliver a frame
    Source {
        camera: String,
        frame_index: u64,
        reason: String,
        context: ErrorContext,
    },
    /// Frame pair capture timestamps differ by more than the tolerance
    Sync {
        frame_index: u64,
        skew_ns: u64,
        tolerance_ns: u64,
        context: ErrorContext,
    },
    /// A device kernel failed
    Kernel {
        stage: String,
        reason: String,
        context: ErrorContext,
    },
    /// Device memory could not be provided
    Resource {
        resource: String,
        reason: String,
        context: ErrorContext,
    },
    /// A buffer handle was used after its buffer was released
    StaleHandle {
        handle: String,
        context: ErrorContext,
    },
    /// The encoder sink rejected or lost output
    Encoder {
        reason: String,
        context: ErrorContext,
    },
    /// File-system failure
    Io {
        operation: String,
        path: Option<String>,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// Failure reported by a third-party crate (codec, JSON)
    External {
        library: String,
        source: Box<dyn StdError + Send + Sync>,
        context: ErrorContext,
    },
    /// A bounded wait ran out
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },
    /// Input that breaks an API contract
    Validation {
        field: String,
        constraint: String,
        value: String,
        context: ErrorContext,
    },
    /// Operation not allowed in the current state
    State {
        current_state: String,
        attempted_operation: String,
        reason: String,
        context: ErrorContext,
    },
}

impl StitchError {
    pub fn config(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn calibration(profile: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Calibration {
            profile: profile.into(),
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn checkpoint(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            job: job.into(),
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn source(camera: impl fmt::Display, frame_index: u64, reason: impl Into<String>) -> Self {
        Self::Source {
            camera: camera.to_string(),
            frame_index,
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn sync(frame_index: u64, skew_ns: u64, tolerance_ns: u64) -> Self {
        Self::Sync {
            frame_index,
            skew_ns,
            tolerance_ns,
            context: ErrorContext::new(),
        }
    }

    pub fn kernel(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Kernel {
            stage: stage.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Resource errors are fatal: the pool cap and device allocation failures do not heal.
    pub fn resource(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn stale_handle(handle: impl fmt::Debug) -> Self {
        Self::StaleHandle {
            handle: format!("{handle:?}"),
            context: ErrorContext::fatal(),
        }
    }

    pub fn encoder(reason: impl Into<String>) -> Self {
        Self::Encoder {
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: None,
            source,
            context: ErrorContext::fatal(),
        }
    }

    /// I/O error on a specific file or directory
    pub fn io_at(operation: impl Into<String>, path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: Some(path.as_ref().display().to_string()),
            source,
            context: ErrorContext::fatal(),
        }
    }

    pub fn external(library: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::External {
            library: library.into(),
            source: Box::new(source),
            context: ErrorContext::fatal(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
            context: ErrorContext::new(),
        }
    }

    pub fn validation(field: impl Into<String>, constraint: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
            context: ErrorContext::fatal(),
        }
    }

    pub fn state(
        current_state: impl Into<String>,
        attempted_operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::State {
            current_state: current_state.into(),
            attempted_operation: attempted_operation.into(),
            reason: reason.into(),
            context: ErrorContext::fatal(),
        }
    }

    /// A lock was poisoned by a panicking thread.
    pub fn poisoned(what: impl Into<String>) -> Self {
        Self::state("poisoned", what, "a thread panicked while holding the lock")
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context_mut().recovery_suggestion = Some(suggestion.into());
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.context_mut().severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().metadata.insert(key.into(), value.into());
        self
    }

    /// Promotes a frame-level error to job-fatal, recording why.
    pub fn escalate(self, reason: impl Into<String>) -> Self {
        self.with_severity(ErrorSeverity::Fatal).with_metadata("escalated", reason)
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::Calibration { context, .. } => context,
            Self::Checkpoint { context, .. } => context,
            Self::Source { context, .. } => context,
            Self::Sync { context, .. } => context,
            Self::Kernel { context, .. } => context,
            Self::Resource { context, .. } => context,
            Self::StaleHandle { context, .. } => context,
            Self::Encoder { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::External { context, .. } => context,
            Self::Timeout { context, .. } => context,
            Self::Validation { context, .. } => context,
            Self::State { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::Calibration { context, .. } => context,
            Self::Checkpoint { context, .. } => context,
            Self::Source { context, .. } => context,
            Self::Sync { context, .. } => context,
            Self::Kernel { context, .. } => context,
            Self::Resource { context, .. } => context,
            Self::StaleHandle { context, .. } => context,
            Self::Encoder { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::External { context, .. } => context,
            Self::Timeout { context, .. } => context,
            Self::Validation { context, .. } => context,
            Self::State { context, .. } => context,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Calibration { .. } => "calibration",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Source { .. } => "source",
            Self::Sync { .. } => "sync",
            Self::Kernel { .. } => "kernel",
            Self::Resource { .. } => "resource",
            Self::StaleHandle { .. } => "stale_handle",
            Self::Encoder { .. } => "encoder",
            Self::Io { .. } => "io",
            Self::External { .. } => "external",
            Self::Timeout { .. } => "timeout",
            Self::Validation { .. } => "validation",
            Self::State { .. } => "state",
        }
    }

    /// Whether this is a timeout of the named operation.
    pub fn is_timeout_of(&self, op: &str) -> bool {
        matches!(self, Self::Timeout { operation, .. } if operation == op)
    }
}

impl fmt::Display for StitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StitchError::Config { field, value, reason, .. } => {
                write!(f, "Configuration error in '{}': {} (value: {})", field, reason, value)
            }
            StitchError::Calibration { profile, reason, .. } => {
                write!(f, "Calibration profile '{}' rejected: {}", profile, reason)
            }
            StitchError::Checkpoint { job, reason, .. } => {
                write!(f, "Checkpoint for job '{}' unusable: {}", job, reason)
            }
            StitchError::Source {
                camera,
                frame_index,
                reason,
                ..
            } => {
                write!(f, "Source {} failed at frame {}: {}", camera, frame_index, reason)
            }
            StitchError::Sync {
                frame_index,
                skew_ns,
                tolerance_ns,
                ..
            } => {
                write!(
                    f,
                    "Frame {} rejected: camera skew {}us exceeds tolerance {}us",
                    frame_index,
                    skew_ns / 1_000,
                    tolerance_ns / 1_000
                )
            }
            StitchError::Kernel { stage, reason, .. } => {
                write!(f, "Kernel fault in {}: {}", stage, reason)
            }
            StitchError::Resource { resource, reason, .. } => {
                write!(f, "Cannot provide {}: {}", resource, reason)
            }
            StitchError::StaleHandle { handle, .. } => {
                write!(f, "Stale buffer handle {}", handle)
            }
            StitchError::Encoder { reason, .. } => {
                write!(f, "Encoder failure: {}", reason)
            }
            StitchError::Io {
                operation, path, source, ..
            } => {
                if let Some(path) = path {
                    write!(f, "I/O error during {} on '{}': {}", operation, path, source)
                } else {
                    write!(f, "I/O error during {}: {}", operation, source)
                }
            }
            StitchError::External { library, source, .. } => {
                write!(f, "{} failed: {}", library, source)
            }
            StitchError::Timeout {
                operation, duration_ms, ..
            } => {
                write!(f, "{} timed out after {}ms", operation, duration_ms)
            }
            StitchError::Validation {
                field, constraint, value, ..
            } => {
                write!(f, "Validation failed for '{}': {} (value: {})", field, constraint, value)
            }
            StitchError::State {
                current_state,
                attempted_operation,
                reason,
                ..
            } => {
                write!(
                    f,
                    "Cannot {} while {}: {}",
                    attempted_operation, current_state, reason
                )
            }
        }
    }
}

impl StdError for StitchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::External { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

pub type StitchResult<T> = Result<T, StitchError>;

/// Errors worth another attempt on the same frame
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Recommended pause before the next attempt
    fn retry_delay_ms(&self) -> Option<u64> {
        None
    }
}

impl Retryable for StitchError {
    fn is_retryable(&self) -> bool {
        if self.context().severity == ErrorSeverity::Fatal {
            return false;
        }
        matches!(
            self,
            Self::Source { .. } | Self::Sync { .. } | Self::Kernel { .. } | Self::Timeout { .. }
        )
    }

    fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            Self::Source { .. } => Some(5),
            Self::Kernel { .. } => Some(1),
            _ => None,
        }
    }
}

pub trait Recoverable {
    fn is_recoverable(&self) -> bool {
        !self.recovery_strategies().is_empty()
    }

    /// Recovery strategies, in the order they should be tried
    fn recovery_strategies(&self) -> Vec<RecoveryStrategy>;
}

/// What the frame loop may do about an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry the operation on the same frame
    Retry { delay_ms: u64 },
    /// Give up on the frame and emit a missing marker in its place
    Skip { reason: String },
}

impl Recoverable for StitchError {
    fn recovery_strategies(&self) -> Vec<RecoveryStrategy> {
        if !self.is_retryable() {
            return vec![];
        }
        let retry = RecoveryStrategy::Retry {
            delay_ms: self.retry_delay_ms().unwrap_or(0),
        };
        match self {
            // A panorama that reached the encoder queue is never silently dropped.
            Self::Timeout { operation, .. } if operation == operations::ENCODER_HANDOFF => vec![retry],
            Self::Source { .. } | Self::Kernel { .. } | Self::Timeout { .. } => vec![
                retry,
                RecoveryStrategy::Skip {
                    reason: "drop frame with missing marker".to_string(),
                },
            ],
            Self::Sync { .. } => vec![
                retry,
                RecoveryStrategy::Skip {
                    reason: "drop desynchronized pair".to_string(),
                },
            ],
            _ => vec![retry],
        }
    }
}

pub trait HasSeverity {
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for StitchError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

/// Operator-facing hint attached where the error was raised
pub trait HasRecoverySuggestion {
    fn recovery_suggestion(&self) -> Option<&str>;
}

impl HasRecoverySuggestion for StitchError {
    fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

/// Maps errors onto the engine's three reactions
pub mod classify {
    use super::*;

    /// How the engine reacts to an error
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorClass {
        Transient,
        SyncRejection,
        JobFatal,
    }

    pub fn class_of(error: &StitchError) -> ErrorClass {
        if error.severity() == ErrorSeverity::Fatal {
            return ErrorClass::JobFatal;
        }
        match error {
            StitchError::Sync { .. } => ErrorClass::SyncRejection,
            e if e.is_retryable() => ErrorClass::Transient,
            _ => ErrorClass::JobFatal,
        }
    }

    pub fn is_transient(error: &StitchError) -> bool {
        class_of(error) == ErrorClass::Transient
    }

    pub fn is_fatal(error: &StitchError) -> bool {
        class_of(error) == ErrorClass::JobFatal
    }

    /// Whether exhausting retries may end in dropping the frame rather than the job.
    pub fn allows_frame_drop(error: &StitchError) -> bool {
        error
            .recovery_strategies()
            .iter()
            .any(|s| matches!(s, RecoveryStrategy::Skip { .. }))
    }
}

impl From<std::io::Error> for StitchError {
    fn from(error: std::io::Error) -> Self {
        Self::io("file access", error)
    }
}

impl From<serde_json::Error> for StitchError {
    fn from(error: serde_json::Error) -> Self {
        Self::external("serde_json", error)
    }
}

impl From<image::ImageError> for StitchError {
    fn from(error: image::ImageError) -> Self {
        Self::external("image", error)
    }
}

impl From<pano_warp::WarpError> for StitchError {
    fn from(error: pano_warp::WarpError) -> Self {
        Self::kernel("pano_warp", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classify::ErrorClass;

    #[test]
    fn test_config_error_is_job_fatal() {
        let error = StitchError::config("queue_depth", "0", "must be greater than 0");
        assert_eq!(error.category(), "config");
        assert!(!error.is_retryable());
        assert_eq!(classify::class_of(&error), ErrorClass::JobFatal);
    }

    #[test]
    fn test_kernel_fault_carries_annotations() {
        let error = StitchError::kernel("stitch", "device fault")
            .with_context("composing frame 7")
            .with_recovery_suggestion("inspect device logs");

        assert_eq!(error.category(), "kernel");
        assert!(error.is_retryable());
        assert_eq!(error.recovery_suggestion(), Some("inspect device logs"));
        assert_eq!(error.context().context.as_deref(), Some("composing frame 7"));
    }

    #[test]
    fn test_every_error_maps_to_one_class() {
        assert_eq!(
            classify::class_of(&StitchError::source("cam0", 3, "decode glitch")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify::class_of(&StitchError::sync(3, 20_000_000, 8_000_000)),
            ErrorClass::SyncRejection
        );
        assert!(classify::is_fatal(&StitchError::calibration("rig-a", "resolution mismatch")));
        assert!(classify::is_fatal(&StitchError::resource("pool", "cap exceeded")));
        assert!(classify::is_fatal(&StitchError::stale_handle(17u32)));
        assert!(classify::is_fatal(&StitchError::checkpoint("job", "digest mismatch")));
        assert!(classify::is_transient(&StitchError::timeout(
            operations::BUFFER_ACQUIRE,
            100
        )));
    }

    #[test]
    fn test_escalation_makes_transient_fatal() {
        let error = StitchError::sync(9, 1, 0).escalate("10 consecutive desynchronized pairs");
        assert!(classify::is_fatal(&error));
        assert!(!error.is_retryable());
        assert!(error.context().metadata.contains_key("escalated"));
    }

    #[test]
    fn test_handoff_timeout_never_skips_frame() {
        let acquire = StitchError::timeout(operations::BUFFER_ACQUIRE, 100);
        let handoff = StitchError::timeout(operations::ENCODER_HANDOFF, 100);
        assert!(classify::allows_frame_drop(&acquire));
        assert!(!classify::allows_frame_drop(&handoff));
        assert!(handoff.is_recoverable());
        assert!(handoff.is_timeout_of(operations::ENCODER_HANDOFF));
    }

    #[test]
    fn test_display_messages() {
        let error = StitchError::sync(12, 12_500_000, 8_000_000);
        assert_eq!(
            error.to_string(),
            "Frame 12 rejected: camera skew 12500us exceeds tolerance 8000us"
        );
    }
}
