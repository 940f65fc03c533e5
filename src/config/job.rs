//! Job submission descriptors.

use crate::error::{StitchError, StitchResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where one camera's recording lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Directory of numbered frames
    pub path: PathBuf,
    /// Capture rate; the environment's default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

impl SourceRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fps: None,
        }
    }
}

/// One whole-game job: two recordings, a calibration profile and an output target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Stable job name; keys the checkpoint
    pub name: String,
    pub left_source: SourceRef,
    pub right_source: SourceRef,
    pub calibration_profile: String,
    pub output: PathBuf,
    /// Continue after the last checkpoint instead of starting over
    #[serde(default)]
    pub resume: bool,
}

impl JobDescriptor {
    pub fn from_json_file(path: impl AsRef<Path>) -> StitchResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StitchError::io_at("read job", path, e))?;
        let job: Self = serde_json::from_str(&text)
            .map_err(|e| StitchError::config("job", path.display().to_string(), e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> StitchResult<()> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !name_ok {
            return Err(StitchError::validation("name", "non-empty [A-Za-z0-9._-]", &self.name));
        }
        if self.calibration_profile.is_empty() {
            return Err(StitchError::validation("calibration_profile", "non-empty", ""));
        }
        for source in [&self.left_source, &self.right_source] {
            if let Some(fps) = source.fps {
                if !(fps.is_finite() && fps > 0.0) {
                    return Err(StitchError::validation("fps", "positive", fps.to_string()));
                }
            }
        }
        Ok(())
    }
}
