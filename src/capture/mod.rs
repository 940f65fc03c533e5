// # Capture Module
//
// Frame sources feeding the pipeline. A source delivers host-memory RGB8 frames of one
// camera by frame index, which lets a resumed job start reading after its checkpoint
// without replaying the frames before it.

pub mod image_sequence;
pub mod sync;
pub mod synthetic;

use crate::core::frame::{CameraId, FrameIndex, RawImage, Resolution};
use crate::error::StitchResult;

/// One camera's recorded stream.
pub trait FrameSource: Send {
    fn camera(&self) -> CameraId;

    /// Resolution of every frame the source delivers.
    fn resolution(&self) -> Resolution;

    /// Number of frames in the stream.
    fn frame_count(&self) -> u64;

    /// Reads frame `index`; `Ok(None)` past the end of the stream.
    ///
    /// Decode glitches are reported as retryable [`StitchError::Source`] errors.
    ///
    /// [`StitchError::Source`]: crate::error::StitchError::Source
    fn read_frame(&mut self, index: FrameIndex) -> StitchResult<Option<RawImage>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn camera(&self) -> CameraId {
        (**self).camera()
    }

    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn frame_count(&self) -> u64 {
        (**self).frame_count()
    }

    fn read_frame(&mut self, index: FrameIndex) -> StitchResult<Option<RawImage>> {
        (**self).read_frame(index)
    }
}

pub use image_sequence::ImageSequenceSource;
pub use sync::{FramePairer, RawPair};
pub use synthetic::{DriftSchedule, FaultPlan, SyntheticLayout, SyntheticRig, SyntheticSource};
