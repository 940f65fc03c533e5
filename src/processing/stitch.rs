//! # Stitching Stage
//!
//! Warps both color-matched frames into panorama space with their calibrated homographies
//! and blends them across the seam band.
//!
//! ## Alignment Tracking
//!
//! Mechanical drift of the rig shifts cam1's content relative to its calibration. Each
//! frame the stage searches a small window around the current prior for the translation
//! that best lines cam1 up with cam0 over the seam, and folds the measurement into the
//! prior with an exponential moving average. The composite applies the prior on top of
//! cam1's homography.
//!
//! A measurement further than the drift threshold from the prior is not trusted: the
//! prior is discarded, the frame is composed with the calibration default and flagged as
//! degraded, and tracking starts over from the next frame.

use crate::core::buffer_pool::SizeClass;
use crate::core::frame::{CameraId, DegradedReason, Frame};
use crate::error::{StitchError, StitchResult};
use crate::processing::processing::{
    AlignmentPrior, Packet, Payload, PipelineStage, StageContext, StageKind, StageSnapshot,
};
use pano_warp::align::{AlignmentEstimate, SeamProbe, estimate_offset};
use pano_warp::blend::blend_layers;
use pano_warp::warp::{Homography, warp_to_panorama};
use pano_warp::{ImageMut, ImageRef};
use tracing::{debug, warn};

/// What the stage decided to do with one alignment measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlignmentDecision {
    /// Compose with this offset and keep it as the prior.
    Track(AlignmentPrior),
    /// Compose with the calibration default and drop the prior.
    Fallback,
}

/// Pure update rule for the alignment prior.
pub fn decide_alignment(
    prior: Option<AlignmentPrior>,
    measured: Option<AlignmentEstimate>,
    min_contrast: f64,
    drift_threshold_px: f64,
    alpha: f64,
) -> AlignmentDecision {
    let measured = measured
        .filter(|m| m.contrast >= min_contrast)
        .map(|m| AlignmentPrior { dx: m.dx, dy: m.dy });
    match (prior, measured) {
        (prior, None) => AlignmentDecision::Track(prior.unwrap_or(AlignmentPrior { dx: 0.0, dy: 0.0 })),
        (None, Some(m)) => AlignmentDecision::Track(m),
        (Some(p), Some(m)) if p.distance_to(&m) > drift_threshold_px => AlignmentDecision::Fallback,
        (Some(p), Some(m)) => AlignmentDecision::Track(p.smoothed(&m, alpha)),
    }
}

pub struct StitchStage {
    ctx: StageContext,
    prior: Option<AlignmentPrior>,
    left_from_panorama: Homography,
    right_to_panorama: Homography,
    right_from_panorama: Homography,
}

impl StitchStage {
    pub fn new(ctx: StageContext) -> Self {
        let left = ctx.calibration.left();
        let right = ctx.calibration.right();
        Self {
            left_from_panorama: left.from_panorama,
            right_to_panorama: right.to_panorama,
            right_from_panorama: right.from_panorama,
            ctx,
            prior: None,
        }
    }

    pub fn prior(&self) -> Option<AlignmentPrior> {
        self.prior
    }

    fn measure(&self, left: &Frame, right: &Frame) -> StitchResult<Option<AlignmentEstimate>> {
        let cfg = self.ctx.config.alignment.clone();
        let band = self.ctx.calibration.seam_rect();
        let center = self.prior.map_or((0.0, 0.0), |p| (p.dx, p.dy));
        let (res_l, res_r) = (left.resolution, right.resolution);
        let (a, b) = (left.buffer.memory(), right.buffer.memory());
        let a_from = self.left_from_panorama;
        let b_from = self.right_from_panorama;

        let pending = self.ctx.device.submit_with_result("seam_align", move || {
            let a = a.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let b = b.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let a = ImageRef::new(&a[..res_l.byte_len()], res_l.width, res_l.height)?;
            let b = ImageRef::new(&b[..res_r.byte_len()], res_r.width, res_r.height)?;
            let probe = SeamProbe::new(a, &a_from, b, b_from, band, cfg.sample_step);
            Ok(estimate_offset(&probe, center, cfg.search_radius_px))
        })?;
        left.buffer.record_use(pending.fence());
        right.buffer.record_use(pending.fence());
        pending.wait()
    }

    fn composite(&self, left: &Frame, right: &Frame, offset: AlignmentPrior) -> StitchResult<Frame> {
        let pano = self.ctx.calibration.panorama();
        let seam = self.ctx.calibration.seam();
        let blend = self.ctx.config.blend;
        let border = self.ctx.config.border;
        let a_from = self.left_from_panorama;
        let b_from = self
            .right_to_panorama
            .then_translate(offset.dx, offset.dy)
            .inverse()
            .map_err(|e| StitchError::kernel(StageKind::Stitching.name(), e.to_string()))?;

        let lease = self.ctx.memory.acquire(SizeClass::Panorama)?;
        let (res_l, res_r) = (left.resolution, right.resolution);
        let (a, b) = (left.buffer.memory(), right.buffer.memory());
        let dst = lease.memory();
        let fence = self.ctx.device.submit("composite", move || {
            let a = a.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let b = b.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let a = ImageRef::new(&a[..res_l.byte_len()], res_l.width, res_l.height)?;
            let b = ImageRef::new(&b[..res_r.byte_len()], res_r.width, res_r.height)?;
            let layer_a = warp_to_panorama(&a, &a_from, border, pano.width, pano.height)?;
            let layer_b = warp_to_panorama(&b, &b_from, border, pano.width, pano.height)?;
            let mut dst = dst.write().map_err(|_| StitchError::poisoned("buffer"))?;
            let mut out = ImageMut::new(&mut dst[..pano.byte_len()], pano.width, pano.height)?;
            blend_layers(&layer_a, &layer_b, seam.start_x..seam.end_x, blend, &mut out)?;
            Ok(())
        })?;
        left.buffer.record_use(&fence);
        right.buffer.record_use(&fence);
        lease.record_use(&fence);
        fence.wait()?;
        Ok(Frame::new(CameraId::LEFT, left.timestamp_ns.min(right.timestamp_ns), pano, lease))
    }
}

impl PipelineStage for StitchStage {
    fn kind(&self) -> StageKind {
        StageKind::Stitching
    }

    fn process(&mut self, packet: &Packet) -> StitchResult<Packet> {
        let pair = packet.expect_pair(self.kind())?;
        let measured = self.measure(&pair.left, &pair.right)?;
        let cfg = &self.ctx.config.alignment;
        let decision = decide_alignment(self.prior, measured, cfg.min_contrast, cfg.drift_threshold_px, cfg.alpha);

        let mut flags = packet.flags.clone();
        let (offset, next_prior) = match decision {
            AlignmentDecision::Track(offset) => (offset, Some(offset)),
            AlignmentDecision::Fallback => {
                warn!(
                    frame = packet.index,
                    prior = ?self.prior,
                    measured = ?measured.map(|m| (m.dx, m.dy)),
                    "seam drift beyond threshold, using calibrated transform"
                );
                flags.mark_degraded(DegradedReason::DriftFallback);
                (AlignmentPrior { dx: 0.0, dy: 0.0 }, None)
            }
        };

        let panorama = self.composite(&pair.left, &pair.right, offset)?;
        self.prior = next_prior;
        debug!(frame = packet.index, dx = offset.dx, dy = offset.dy, "stitched");

        let mut out = packet.with_payload(Payload::Panorama(panorama));
        out.flags = flags;
        Ok(out)
    }

    fn snapshot(&self, state: &mut StageSnapshot) {
        state.alignment = self.prior;
    }

    fn restore(&mut self, state: &StageSnapshot) {
        self.prior = state.alignment;
    }

    fn reset(&mut self) {
        self.prior = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{DriftSchedule, SyntheticRig};
    use crate::config::PipelineConfig;
    use crate::processing::color::ColorMatchStage;
    use crate::processing::fixtures;
    use crate::processing::undistort::UndistortStage;

    fn estimate(dx: f64, dy: f64, contrast: f64) -> Option<AlignmentEstimate> {
        Some(AlignmentEstimate {
            dx,
            dy,
            cost: 1.0,
            contrast,
        })
    }

    #[test]
    fn test_decision_rules() {
        let p = Some(AlignmentPrior { dx: 1.0, dy: 0.0 });
        // flat seam keeps the prior
        assert_eq!(
            decide_alignment(p, estimate(9.0, 0.0, 0.1), 1.0, 3.0, 0.5),
            AlignmentDecision::Track(AlignmentPrior { dx: 1.0, dy: 0.0 })
        );
        // first measurement seeds
        assert_eq!(
            decide_alignment(None, estimate(2.0, 1.0, 5.0), 1.0, 3.0, 0.5),
            AlignmentDecision::Track(AlignmentPrior { dx: 2.0, dy: 1.0 })
        );
        // small move is smoothed
        assert_eq!(
            decide_alignment(p, estimate(3.0, 0.0, 5.0), 1.0, 3.0, 0.5),
            AlignmentDecision::Track(AlignmentPrior { dx: 2.0, dy: 0.0 })
        );
        // jump beyond the threshold falls back
        assert_eq!(
            decide_alignment(p, estimate(5.0, 0.0, 5.0), 1.0, 3.0, 0.5),
            AlignmentDecision::Fallback
        );
        assert_eq!(
            decide_alignment(None, None, 1.0, 3.0, 0.5),
            AlignmentDecision::Track(AlignmentPrior { dx: 0.0, dy: 0.0 })
        );
    }

    fn run(rig: &SyntheticRig, config: PipelineConfig) -> (Vec<Packet>, StitchStage) {
        let ctx = fixtures::context(rig, config);
        let mut undistort = UndistortStage::new(ctx.clone());
        let mut color = ColorMatchStage::new(ctx.clone());
        let mut stitch = StitchStage::new(ctx.clone());
        let mut out = Vec::new();
        for index in 0..rig.frame_count() {
            let raw = fixtures::raw_packet(&ctx, rig, index);
            let p = undistort.process(&raw).unwrap();
            let p = color.process(&p).unwrap();
            let mut p = stitch.process(&p).unwrap();
            stitch.snapshot(&mut p.state);
            out.push(p);
        }
        (out, stitch)
    }

    #[test]
    fn test_static_rig_matches_ideal_panorama() {
        let rig = SyntheticRig::new(64, 32).frames(2);
        let (packets, stage) = run(&rig, PipelineConfig::default());
        let pano = rig.panorama();
        let frame = packets[1].expect_panorama(StageKind::Stitching).unwrap();
        assert_eq!(frame.resolution, pano);
        assert_eq!(frame.buffer.size_class(), SizeClass::Panorama);

        let err = fixtures::mean_abs_diff_interior(
            &frame.download().unwrap(),
            &rig.ideal_panorama(1),
            pano.width as usize,
            pano.height as usize,
            2,
        );
        assert!(err < 2.0, "panorama error {err}");
        let prior = stage.prior().unwrap();
        assert!(prior.dx.abs() < 0.5 && prior.dy.abs() < 0.5, "{prior:?}");
    }

    #[test]
    fn test_tracks_small_drift() {
        let rig = SyntheticRig::new(64, 32)
            .frames(12)
            .drift(DriftSchedule::default().step(2, 2.0, 0.0));
        let (packets, stage) = run(&rig, PipelineConfig::default());
        assert!(packets.iter().all(|p| !p.flags.is_degraded()));
        let prior = stage.prior().unwrap();
        assert!((prior.dx - 2.0).abs() < 0.5, "{prior:?}");
        assert_eq!(packets.last().unwrap().state.alignment, Some(prior));
    }

    #[test]
    fn test_large_jump_falls_back_then_recovers() {
        let rig = SyntheticRig::new(64, 32)
            .frames(6)
            .drift(DriftSchedule::default().step(3, 5.0, 0.0));
        let (packets, stage) = run(&rig, PipelineConfig::default());
        assert!(!packets[2].flags.is_degraded());
        assert!(packets[3].flags.degraded.contains(&DegradedReason::DriftFallback));
        assert_eq!(packets[3].state.alignment, None);
        assert!(!packets[4].flags.is_degraded());
        let prior = stage.prior().unwrap();
        assert!((prior.dx - 5.0).abs() < 0.5, "{prior:?}");
    }
}
