//! How a queued job finds its inputs and outputs.

use crate::calibration::{CalibrationProfile, CalibrationStore};
use crate::capture::{FrameSource, ImageSequenceSource};
use crate::config::JobDescriptor;
use crate::core::frame::{CameraId, FrameIndex};
use crate::error::StitchResult;
use crate::jobs::checkpoint::CheckpointStore;
use crate::processing::{EncoderSink, RawFileSink};
use std::path::PathBuf;
use std::sync::Arc;

/// Resolves the external resources a [`JobDescriptor`] names.
///
/// Calls happen on a blocking thread right before the job's session is built.
pub trait JobEnvironment: Send + Sync {
    fn load_calibration(&self, profile_id: &str) -> StitchResult<Arc<CalibrationProfile>>;

    /// Opens cam0 and cam1, in that order.
    fn open_sources(&self, job: &JobDescriptor) -> StitchResult<(Box<dyn FrameSource>, Box<dyn FrameSource>)>;

    /// Opens the encoder sink. With `resume_after`, output past that frame is
    /// discarded and encoding continues after it.
    fn open_sink(&self, job: &JobDescriptor, resume_after: Option<FrameIndex>) -> StitchResult<Box<dyn EncoderSink>>;

    fn checkpoints(&self) -> CheckpointStore;
}

/// Calibration profiles, image sequences and raw output files on local disk.
#[derive(Clone, Debug)]
pub struct FileSystemEnvironment {
    calibration: CalibrationStore,
    checkpoints: CheckpointStore,
    default_fps: f64,
}

impl FileSystemEnvironment {
    pub fn new(calibration_dir: impl Into<PathBuf>, checkpoint_dir: impl Into<PathBuf>, default_fps: f64) -> Self {
        Self {
            calibration: CalibrationStore::new(calibration_dir),
            checkpoints: CheckpointStore::new(checkpoint_dir),
            default_fps,
        }
    }
}

impl JobEnvironment for FileSystemEnvironment {
    fn load_calibration(&self, profile_id: &str) -> StitchResult<Arc<CalibrationProfile>> {
        self.calibration.load(profile_id)
    }

    fn open_sources(&self, job: &JobDescriptor) -> StitchResult<(Box<dyn FrameSource>, Box<dyn FrameSource>)> {
        let left = ImageSequenceSource::open(
            &job.left_source.path,
            CameraId::LEFT,
            job.left_source.fps.unwrap_or(self.default_fps),
        )?;
        let right = ImageSequenceSource::open(
            &job.right_source.path,
            CameraId::RIGHT,
            job.right_source.fps.unwrap_or(self.default_fps),
        )?;
        Ok((Box::new(left), Box::new(right)))
    }

    fn open_sink(&self, job: &JobDescriptor, resume_after: Option<FrameIndex>) -> StitchResult<Box<dyn EncoderSink>> {
        let sink = match resume_after {
            Some(last) => RawFileSink::resume(&job.output, last)?,
            None => RawFileSink::create(&job.output)?,
        };
        Ok(Box::new(sink))
    }

    fn checkpoints(&self) -> CheckpointStore {
        self.checkpoints.clone()
    }
}
