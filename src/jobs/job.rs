//! Job identity and lifecycle status.

use crate::core::device::DeviceId;
use crate::core::frame::FrameIndex;
use crate::session::SessionReport;
use serde::Serialize;
use std::fmt;

/// Queue-assigned job handle, unique per queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Failure reason recorded for jobs cancelled by the caller.
pub const CANCELLED: &str = "cancelled";

/// Snapshot of one job as seen by the queue.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    /// Device the job ran (or runs) on
    pub device: Option<DeviceId>,
    pub failure: Option<String>,
    pub last_checkpoint: Option<FrameIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SessionReport>,
}

impl JobStatus {
    pub(crate) fn queued(id: JobId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: JobState::Queued,
            device: None,
            failure: None,
            last_checkpoint: None,
            report: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == JobState::Failed && self.failure.as_deref() == Some(CANCELLED)
    }
}
