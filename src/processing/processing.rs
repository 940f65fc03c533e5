//! # Stage Pipeline Abstractions
//!
//! The pieces every pipeline stage shares: the [`PipelineStage`] trait, the [`Packet`]
//! travelling between stages, and the per-job smoothed state the stateful stages keep.
//!
//! ## Architecture
//!
//! ```text
//! ingest ─► Undistortion ─► ColorMatching ─► Stitching ─► CodecHandoff ─► encoder
//!   Pair        Pair             Pair          Panorama      Delivered
//! ```
//!
//! A stage receives each packet by reference and returns a new one, so a failed attempt
//! leaves the input intact for a retry. Frames are never mutated in place: a stage that
//! changes pixels writes them into a fresh buffer from the memory manager, and a stage
//! that does not simply clones the frame handle.
//!
//! ## Stage-Local State
//!
//! Color and alignment estimates persist across frames. After a stage handles a packet
//! the runner asks it to [`snapshot`](PipelineStage::snapshot) its state into the packet,
//! so the state stored with the checkpoint of frame K is exactly the state after K, no
//! matter how far upstream stages have run ahead.

use crate::calibration::CalibrationProfile;
use crate::config::PipelineConfig;
use crate::core::buffer_pool::MemoryManager;
use crate::core::device::DeviceContext;
use crate::core::frame::{Frame, FrameFlags, FrameIndex, FramePair, MissingReason};
use crate::error::{StitchError, StitchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The four stages, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Undistortion,
    ColorMatching,
    Stitching,
    CodecHandoff,
}

impl StageKind {
    pub const ORDER: [StageKind; 4] = [
        StageKind::Undistortion,
        StageKind::ColorMatching,
        StageKind::Stitching,
        StageKind::CodecHandoff,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Undistortion => "undistort",
            StageKind::ColorMatching => "color",
            StageKind::Stitching => "stitch",
            StageKind::CodecHandoff => "codec",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-channel gain and bias mapping cam1's exposure onto cam0's.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorEstimate {
    pub gain: [f64; 3],
    pub bias: [f64; 3],
}

impl ColorEstimate {
    pub const IDENTITY: ColorEstimate = ColorEstimate {
        gain: [1.0; 3],
        bias: [0.0; 3],
    };

    /// `alpha * measured + (1 - alpha) * self`, per coefficient.
    pub fn smoothed(&self, measured: &ColorEstimate, alpha: f64) -> ColorEstimate {
        let mix = |old: f64, new: f64| alpha * new + (1.0 - alpha) * old;
        ColorEstimate {
            gain: std::array::from_fn(|c| mix(self.gain[c], measured.gain[c])),
            bias: std::array::from_fn(|c| mix(self.bias[c], measured.bias[c])),
        }
    }
}

/// Translation of cam1 in panorama pixels on top of its calibrated homography.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPrior {
    pub dx: f64,
    pub dy: f64,
}

impl AlignmentPrior {
    pub fn distance_to(&self, other: &AlignmentPrior) -> f64 {
        (self.dx - other.dx).hypot(self.dy - other.dy)
    }

    pub fn smoothed(&self, measured: &AlignmentPrior, alpha: f64) -> AlignmentPrior {
        AlignmentPrior {
            dx: alpha * measured.dx + (1.0 - alpha) * self.dx,
            dy: alpha * measured.dy + (1.0 - alpha) * self.dy,
        }
    }
}

/// Smoothed stage state after a given frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentPrior>,
}

/// What a packet carries at its current point in the pipeline.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Both camera frames, before stitching
    Pair(FramePair),
    /// The stitched frame
    Panorama(Frame),
    /// Handed to the encoder
    Delivered,
    /// Stands in for a dropped frame
    Missing(MissingReason),
}

/// One frame index moving through the pipeline.
#[derive(Clone, Debug)]
pub struct Packet {
    pub index: FrameIndex,
    pub timestamp_ns: u64,
    pub payload: Payload,
    pub flags: FrameFlags,
    pub state: StageSnapshot,
}

impl Packet {
    pub fn pair(index: FrameIndex, pair: FramePair) -> Self {
        Self {
            index,
            timestamp_ns: pair.timestamp_ns(),
            payload: Payload::Pair(pair),
            flags: FrameFlags::default(),
            state: StageSnapshot::default(),
        }
    }

    pub fn missing(index: FrameIndex, timestamp_ns: u64, reason: MissingReason) -> Self {
        Self {
            index,
            timestamp_ns,
            payload: Payload::Missing(reason),
            flags: FrameFlags::missing(reason),
            state: StageSnapshot::default(),
        }
    }

    /// Replaces this packet's content with a missing marker, keeping index, time and state.
    pub fn to_missing(&self, reason: MissingReason) -> Self {
        Self {
            index: self.index,
            timestamp_ns: self.timestamp_ns,
            payload: Payload::Missing(reason),
            flags: FrameFlags::missing(reason),
            state: self.state.clone(),
        }
    }

    /// Same index, time, flags and state with a new payload.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            index: self.index,
            timestamp_ns: self.timestamp_ns,
            payload,
            flags: self.flags.clone(),
            state: self.state.clone(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self.payload, Payload::Missing(_))
    }

    pub fn expect_pair(&self, stage: StageKind) -> StitchResult<&FramePair> {
        match &self.payload {
            Payload::Pair(pair) => Ok(pair),
            other => Err(self.unexpected(stage, other)),
        }
    }

    pub fn expect_panorama(&self, stage: StageKind) -> StitchResult<&Frame> {
        match &self.payload {
            Payload::Panorama(frame) => Ok(frame),
            other => Err(self.unexpected(stage, other)),
        }
    }

    fn unexpected(&self, stage: StageKind, payload: &Payload) -> StitchError {
        let kind = match payload {
            Payload::Pair(_) => "pair",
            Payload::Panorama(_) => "panorama",
            Payload::Delivered => "delivered",
            Payload::Missing(_) => "missing",
        };
        StitchError::state(kind, stage.name(), format!("frame {} arrived out of stage order", self.index))
    }
}

/// Shared, read-only resources of one job's pipeline.
#[derive(Clone)]
pub struct StageContext {
    pub device: Arc<DeviceContext>,
    pub memory: Arc<MemoryManager>,
    pub calibration: Arc<CalibrationProfile>,
    pub config: Arc<PipelineConfig>,
}

/// One pipeline stage.
pub trait PipelineStage: Send {
    fn kind(&self) -> StageKind;

    /// Handles one frame. A failure leaves stage state untouched so the frame can be retried.
    fn process(&mut self, packet: &Packet) -> StitchResult<Packet>;

    /// Forwards a missing marker.
    fn pass_missing(&mut self, packet: &Packet) -> StitchResult<Packet> {
        Ok(packet.clone())
    }

    /// Writes the stage's current smoothed state into `state`.
    fn snapshot(&self, _state: &mut StageSnapshot) {}

    /// Adopts state recorded by a checkpoint.
    fn restore(&mut self, _state: &StageSnapshot) {}

    /// Clears all per-job state.
    fn reset(&mut self) {}

    /// Called once after the last packet.
    fn finish(&mut self) -> StitchResult<()> {
        Ok(())
    }
}
