//! # Color Matching Stage
//!
//! Equalizes exposure and white balance across the seam. cam0 is the reference; cam1 is
//! corrected with a per-channel gain and bias fitted from the mean and variance of the
//! overlap region in both rectified frames:
//!
//! ```text
//! gain_c = sigma0_c / sigma1_c        bias_c = mu0_c - gain_c * mu1_c
//! ```
//!
//! The estimate is smoothed over time with a small fixed weight so the correction does
//! not flicker. A textureless overlap (variance under the floor) produces no usable
//! measurement; the previous estimate is reused and the frame is flagged. Before the
//! first measurement there is no estimate at all: such frames pass uncorrected.

use crate::core::buffer_pool::SizeClass;
use crate::core::frame::{DegradedReason, Frame, FramePair};
use crate::error::{StitchError, StitchResult};
use crate::processing::processing::{
    ColorEstimate, Packet, Payload, PipelineStage, StageContext, StageKind, StageSnapshot,
};
use pano_warp::stats::{ChannelStats, apply_gain_bias, channel_stats};
use pano_warp::{ImageMut, ImageRef};
use tracing::debug;

/// Fits the gain/bias that maps `moving` statistics onto `reference` statistics.
///
/// `None` when either side's variance is below `min_variance`.
pub fn fit_gain_bias(reference: &ChannelStats, moving: &ChannelStats, min_variance: f64) -> Option<ColorEstimate> {
    if reference.min_variance() < min_variance || moving.min_variance() < min_variance {
        return None;
    }
    let sigma_ref = reference.std_dev();
    let sigma_mov = moving.std_dev();
    let gain: [f64; 3] = std::array::from_fn(|c| sigma_ref[c] / sigma_mov[c]);
    let bias = std::array::from_fn(|c| reference.mean[c] - gain[c] * moving.mean[c]);
    Some(ColorEstimate { gain, bias })
}

/// Temporal gain/bias tracking for cam1.
pub struct ColorMatchStage {
    ctx: StageContext,
    alpha: f64,
    min_variance: f64,
    estimate: Option<ColorEstimate>,
}

impl ColorMatchStage {
    pub fn new(ctx: StageContext) -> Self {
        let alpha = ctx.config.color.alpha;
        let min_variance = ctx.config.color.min_variance;
        Self {
            ctx,
            alpha,
            min_variance,
            estimate: None,
        }
    }

    pub fn estimate(&self) -> Option<ColorEstimate> {
        self.estimate
    }

    fn measure(&self, pair: &FramePair) -> StitchResult<(ChannelStats, ChannelStats)> {
        let left = self.ctx.calibration.left();
        let right = self.ctx.calibration.right();
        let (left_region, right_region) = (left.model.overlap, right.model.overlap);
        let res = left.model.rectified_resolution;
        let a = pair.left.buffer.memory();
        let b = pair.right.buffer.memory();
        let pending = self.ctx.device.submit_with_result("color_stats", move || {
            let a = a.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let b = b.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let a = ImageRef::new(&a[..res.byte_len()], res.width, res.height)?;
            let b = ImageRef::new(&b[..res.byte_len()], res.width, res.height)?;
            Ok((channel_stats(&a, left_region)?, channel_stats(&b, right_region)?))
        })?;
        pair.left.buffer.record_use(pending.fence());
        pair.right.buffer.record_use(pending.fence());
        pending.wait()
    }

    fn correct(&self, frame: &Frame, estimate: ColorEstimate) -> StitchResult<Frame> {
        let res = frame.resolution;
        let lease = self.ctx.memory.acquire(SizeClass::Matched)?;
        let src = frame.buffer.memory();
        let dst = lease.memory();
        let fence = self.ctx.device.submit("color_apply", move || {
            let src = src.read().map_err(|_| StitchError::poisoned("buffer"))?;
            let mut dst = dst.write().map_err(|_| StitchError::poisoned("buffer"))?;
            let input = ImageRef::new(&src[..res.byte_len()], res.width, res.height)?;
            let mut output = ImageMut::new(&mut dst[..res.byte_len()], res.width, res.height)?;
            apply_gain_bias(&input, estimate.gain, estimate.bias, &mut output)?;
            Ok(())
        })?;
        frame.buffer.record_use(&fence);
        lease.record_use(&fence);
        fence.wait()?;
        Ok(Frame::new(frame.camera, frame.timestamp_ns, res, lease))
    }
}

impl PipelineStage for ColorMatchStage {
    fn kind(&self) -> StageKind {
        StageKind::ColorMatching
    }

    fn process(&mut self, packet: &Packet) -> StitchResult<Packet> {
        let pair = packet.expect_pair(self.kind())?;
        let (reference, moving) = self.measure(pair)?;

        let mut flags = packet.flags.clone();
        let next = match fit_gain_bias(&reference, &moving, self.min_variance) {
            Some(measured) => Some(match self.estimate {
                None => measured,
                Some(previous) => previous.smoothed(&measured, self.alpha),
            }),
            None => {
                debug!(frame = packet.index, "overlap too flat for a color measurement");
                flags.mark_degraded(DegradedReason::ColorEstimateStale);
                self.estimate
            }
        };

        // Until something has been measured the frame passes uncorrected, and the first
        // real measurement seeds the estimate.
        let right = self.correct(&pair.right, next.unwrap_or(ColorEstimate::IDENTITY))?;
        // Commit only once the frame has been produced, so a retried frame measures afresh.
        self.estimate = next;

        let mut out = packet.with_payload(Payload::Pair(FramePair {
            left: pair.left.clone(),
            right,
        }));
        out.flags = flags;
        Ok(out)
    }

    fn snapshot(&self, state: &mut StageSnapshot) {
        state.color = self.estimate;
    }

    fn restore(&mut self, state: &StageSnapshot) {
        self.estimate = state.color;
    }

    fn reset(&mut self) {
        self.estimate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticRig;
    use crate::config::PipelineConfig;
    use crate::processing::fixtures;
    use crate::processing::undistort::UndistortStage;

    fn stats(mean: f64, variance: f64) -> ChannelStats {
        ChannelStats {
            mean: [mean; 3],
            variance: [variance; 3],
            count: 100,
        }
    }

    #[test]
    fn test_fit_recovers_gain_and_bias() {
        // moving = (reference - 10) / 2  =>  reference = 2 * moving + 10
        let reference = stats(110.0, 400.0);
        let moving = stats(50.0, 100.0);
        let fit = fit_gain_bias(&reference, &moving, 4.0).unwrap();
        assert!((fit.gain[0] - 2.0).abs() < 1e-12);
        assert!((fit.bias[0] - 10.0).abs() < 1e-12);
        assert!(fit_gain_bias(&reference, &stats(50.0, 1.0), 4.0).is_none());
    }

    fn run_frames(rig: &SyntheticRig, frames: u64, config: PipelineConfig) -> (Vec<Packet>, ColorMatchStage) {
        let ctx = fixtures::context(rig, config);
        let mut undistort = UndistortStage::new(ctx.clone());
        let mut color = ColorMatchStage::new(ctx.clone());
        let mut out = Vec::new();
        for index in 0..frames {
            let raw = fixtures::raw_packet(&ctx, rig, index);
            let rectified = undistort.process(&raw).unwrap();
            let mut matched = color.process(&rectified).unwrap();
            color.snapshot(&mut matched.state);
            out.push(matched);
        }
        (out, color)
    }

    #[test]
    fn test_gain_offset_is_equalized() {
        let rig = SyntheticRig::new(48, 24).frames(1).right_gain(1.3);
        let (packets, stage) = run_frames(&rig, 1, PipelineConfig::default());
        let estimate = stage.estimate().unwrap();
        for c in 0..3 {
            assert!((estimate.gain[c] - 1.0 / 1.3).abs() < 0.02, "gain {:?}", estimate.gain);
            assert!(estimate.bias[c].abs() < 3.0, "bias {:?}", estimate.bias);
        }
        assert_eq!(packets[0].state.color, Some(estimate));
        assert!(!packets[0].flags.is_degraded());
    }

    #[test]
    fn test_exposure_step_converges_monotonically() {
        let mut config = PipelineConfig::default();
        config.color.alpha = 0.2;
        let rig = SyntheticRig::new(48, 24).frames(30).right_gain(1.0).exposure_step(5, 1.25);
        let (packets, _) = run_frames(&rig, 30, config);

        let target = 1.0 / 1.25;
        let errors: Vec<f64> = packets[4..]
            .iter()
            .map(|p| (p.state.color.unwrap().gain[0] - target).abs())
            .collect();
        // While the error is well above measurement noise it must shrink every frame.
        for window in errors[..10].windows(2) {
            assert!(window[1] < window[0], "not monotone: {errors:?}");
        }
        assert!(errors[0] > 0.15);
        assert!(*errors.last().unwrap() < 0.02, "not converged: {errors:?}");
    }

    #[test]
    fn test_flat_overlap_reuses_estimate_and_flags_frame() {
        let mut config = PipelineConfig::default();
        config.color.min_variance = 1e9;
        let rig = SyntheticRig::new(32, 16).frames(2);
        let (packets, stage) = run_frames(&rig, 2, config);
        assert_eq!(stage.estimate(), None);
        assert!(packets.iter().all(|p| p.state.color.is_none()));
        assert!(packets[1].flags.degraded.contains(&DegradedReason::ColorEstimateStale));
    }

    #[test]
    fn test_first_measurement_after_flat_start_seeds_estimate() {
        // cam1 is black on frame 0, then exposed at 1.3.
        let rig = SyntheticRig::new(48, 24).frames(4).right_gain(0.0).exposure_step(1, 1.3);
        let (packets, _) = run_frames(&rig, 4, PipelineConfig::default());

        assert!(packets[0].flags.degraded.contains(&DegradedReason::ColorEstimateStale));
        assert_eq!(packets[0].state.color, None);
        for packet in &packets[1..] {
            assert!(!packet.flags.is_degraded());
            let gain = packet.state.color.unwrap().gain;
            for c in 0..3 {
                assert!((gain[c] - 1.0 / 1.3).abs() < 0.02, "frame {} gain {gain:?}", packet.index);
            }
        }
    }

    #[test]
    fn test_restore_and_reset() {
        let ctx = fixtures::context(&SyntheticRig::new(16, 8), PipelineConfig::default());
        let mut stage = ColorMatchStage::new(ctx);
        let snapshot = StageSnapshot {
            color: Some(ColorEstimate {
                gain: [0.5; 3],
                bias: [1.0; 3],
            }),
            alignment: None,
        };
        stage.restore(&snapshot);
        assert_eq!(stage.estimate(), snapshot.color);
        stage.reset();
        assert_eq!(stage.estimate(), None);
    }
}
