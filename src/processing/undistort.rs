//! # Undistortion Stage
//!
//! Removes lens distortion from both raw frames of a pair. Each camera has a precomputed
//! lookup table giving, for every rectified pixel, the raw sensor position to sample;
//! the kernel is one bilinear remap per frame into a fresh rectified buffer.

use crate::core::buffer_pool::SizeClass;
use crate::core::frame::{Frame, FramePair};
use crate::error::{StitchError, StitchResult};
use crate::processing::processing::{Packet, Payload, PipelineStage, StageContext, StageKind};
use pano_warp::remap::{BorderPolicy, remap_rgb};
use pano_warp::{ImageMut, ImageRef};
use std::sync::Arc;

/// Stateless lens correction.
pub struct UndistortStage {
    ctx: StageContext,
    border: BorderPolicy,
}

impl UndistortStage {
    pub fn new(ctx: StageContext) -> Self {
        let border = ctx.config.border;
        Self { ctx, border }
    }

    fn rectify(&self, frame: &Frame) -> StitchResult<Frame> {
        let camera = self.ctx.calibration.camera(frame.camera)?;
        let raw = camera.model.raw_resolution;
        if frame.resolution != raw {
            return Err(StitchError::calibration(
                self.ctx.calibration.profile_id(),
                format!("{} delivered {} frames, profile expects {raw}", frame.camera, frame.resolution),
            ));
        }
        let rectified = camera.model.rectified_resolution;
        let lease = self.ctx.memory.acquire(SizeClass::Rectified)?;

        let table = Arc::clone(&camera.undistort);
        let src = frame.buffer.memory();
        let dst = lease.memory();
        let border = self.border;
        let fence = self.ctx.device.submit("undistort", move || {
            let src = src.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let mut dst = dst.write().map_err(|_| StitchError::poisoned("buffer"))?;
            let input = ImageRef::new(&src[..raw.byte_len()], raw.width, raw.height)?;
            let mut output = ImageMut::new(&mut dst[..rectified.byte_len()], rectified.width, rectified.height)?;
            remap_rgb(&input, &table, border, &mut output)?;
            Ok(())
        })?;
        frame.buffer.record_use(&fence);
        lease.record_use(&fence);
        fence.wait()?;
        Ok(Frame::new(frame.camera, frame.timestamp_ns, rectified, lease))
    }
}

impl PipelineStage for UndistortStage {
    fn kind(&self) -> StageKind {
        StageKind::Undistortion
    }

    fn process(&mut self, packet: &Packet) -> StitchResult<Packet> {
        let pair = packet.expect_pair(self.kind())?;
        let left = self.rectify(&pair.left)?;
        let right = self.rectify(&pair.right)?;
        Ok(packet.with_payload(Payload::Pair(FramePair { left, right })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticRig;
    use crate::config::PipelineConfig;
    use crate::core::frame::CameraId;
    use crate::processing::fixtures;
    use pano_warp::lut::Distortion;

    #[test]
    fn test_identity_profile_passes_pixels_through() {
        let rig = SyntheticRig::new(24, 12).frames(2);
        let ctx = fixtures::context(&rig, PipelineConfig::default());
        let packet = fixtures::raw_packet(&ctx, &rig, 1);
        let mut stage = UndistortStage::new(ctx.clone());

        let out = stage.process(&packet).unwrap();
        let pair = out.expect_pair(StageKind::Undistortion).unwrap();
        assert_eq!(pair.left.download().unwrap(), rig.render(CameraId::LEFT, 1).pixels);
        assert_eq!(pair.left.buffer.size_class(), SizeClass::Rectified);
        assert_eq!(out.index, 1);
    }

    #[test]
    fn test_distorted_rig_is_rectified() {
        let rig = SyntheticRig::new(48, 32)
            .frames(1)
            .pan(0.0)
            .distortion(Distortion::radial(-0.25, 0.0));
        let ctx = fixtures::context(&rig, PipelineConfig::default());
        let packet = fixtures::raw_packet(&ctx, &rig, 0);
        let mut stage = UndistortStage::new(ctx.clone());
        let out = stage.process(&packet).unwrap();
        let pair = out.expect_pair(StageKind::Undistortion).unwrap();

        // The rectified cam0 image should match the world seen through an ideal lens.
        let rectified = pair.left.download().unwrap();
        let ideal = SyntheticRig::new(48, 32).frames(1).pan(0.0).render(CameraId::LEFT, 0).pixels;
        let raw = fixtures::raw_pixels(&packet, CameraId::LEFT);
        let err_rectified = fixtures::mean_abs_diff_interior(&rectified, &ideal, 48, 32, 6);
        let err_raw = fixtures::mean_abs_diff_interior(&raw, &ideal, 48, 32, 6);
        assert!(err_rectified < 3.0, "rectified error {err_rectified}");
        assert!(err_rectified < err_raw);
    }
}
