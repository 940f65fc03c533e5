//! # Processing Module
//!
//! The four pipeline stages and the abstractions they share.

pub mod codec;
pub mod color;
#[allow(clippy::module_inception)]
pub mod processing;
pub mod stitch;
pub mod undistort;

pub use codec::{CodecHandoffStage, EncoderInput, EncoderSink, FrameTag, IndexEntry, Picture, RawFileSink, handoff_queue};
pub use color::ColorMatchStage;
pub use processing::{
    AlignmentPrior, ColorEstimate, Packet, Payload, PipelineStage, StageContext, StageKind, StageSnapshot,
};
pub use stitch::StitchStage;
pub use undistort::UndistortStage;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::capture::sync::FramePairer;
    use crate::capture::synthetic::SyntheticRig;
    use crate::config::PipelineConfig;
    use crate::core::buffer_pool::{MemoryManager, SizeClass};
    use crate::core::device::{DeviceContext, DeviceId};
    use crate::core::frame::{CameraId, Frame, FramePair};
    use crate::session::buffer_bytes;
    use std::sync::Arc;

    /// A device, pools sized for the rig, and its calibration.
    pub fn context(rig: &SyntheticRig, config: PipelineConfig) -> StageContext {
        let calibration = rig.calibration().unwrap();
        let memory = MemoryManager::new(config.pool_hard_cap, config.acquire_timeout());
        for (class, count) in config.pool_plan() {
            memory.configure_class(class, buffer_bytes(&calibration, class), count).unwrap();
        }
        StageContext {
            device: DeviceContext::new(DeviceId(0)).unwrap(),
            memory,
            calibration,
            config: Arc::new(config),
        }
    }

    pub fn raw_packet(ctx: &StageContext, rig: &SyntheticRig, index: u64) -> Packet {
        let (l, r) = rig.sources();
        let mut pairer = FramePairer::new(Box::new(l), Box::new(r), u64::MAX).unwrap();
        let raw = pairer.read_pair(index).unwrap().unwrap();
        let left = Frame::upload(&ctx.device, &ctx.memory, SizeClass::Raw, raw.left).unwrap();
        let right = Frame::upload(&ctx.device, &ctx.memory, SizeClass::Raw, raw.right).unwrap();
        Packet::pair(index, FramePair { left, right })
    }

    pub fn raw_pixels(packet: &Packet, camera: CameraId) -> Vec<u8> {
        let pair = packet.expect_pair(StageKind::Undistortion).unwrap();
        let frame = if camera == CameraId::LEFT { &pair.left } else { &pair.right };
        frame.download().unwrap()
    }

    pub fn mean_abs_diff_interior(a: &[u8], b: &[u8], width: usize, height: usize, margin: usize) -> f64 {
        let mut total = 0f64;
        let mut n = 0usize;
        for y in margin..height - margin {
            for x in margin..width - margin {
                for c in 0..3 {
                    let i = (y * width + x) * 3 + c;
                    total += (a[i] as f64 - b[i] as f64).abs();
                    n += 1;
                }
            }
        }
        total / n as f64
    }
}
