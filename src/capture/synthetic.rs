//! # Synthetic Camera Rig
//!
//! A procedurally textured world seen by two side-by-side cameras with a configurable
//! overlap, lens distortion, exposure difference and mechanical drift. The rig knows the
//! ground truth for every frame, which makes it the fixture for alignment, color and
//! resume tests, and the `pano synth` command writes it out as image sequences plus a
//! calibration profile.
//!
//! ## Geometry
//!
//! ```text
//! panorama x:  0 ............ W-o ....... W ............ 2W-o
//!              |<---- cam0 ---------------->|
//!                             |<---------- cam1 ------------>|
//!                             |<-- seam -->|
//! ```
//!
//! Both cameras share one rectified pinhole model; cam1's homography is a horizontal
//! translation by `W - o`. A drift `(dx, dy)` moves cam1's content by that many panorama
//! pixels relative to its calibration.
//!
//! ## Faults
//!
//! [`FaultPlan`] injects read glitches (a number of failed reads before a frame decodes)
//! and timestamp skew on cam1, so recovery paths can be exercised deterministically.

use crate::calibration::{CalibrationDocument, CalibrationProfile, CalibrationStore, CameraModel, SeamBand};
use crate::capture::FrameSource;
use crate::core::frame::{CameraId, FrameIndex, RawImage, Resolution};
use crate::error::{StitchError, StitchResult};
use pano_warp::Rect;
use pano_warp::lut::{CameraIntrinsics, Distortion};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Piecewise-constant misalignment of cam1, in panorama pixels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriftSchedule {
    steps: Vec<(FrameIndex, (f64, f64))>,
}

impl DriftSchedule {
    /// From frame `at` onward cam1 is displaced by `(dx, dy)`.
    pub fn step(mut self, at: FrameIndex, dx: f64, dy: f64) -> Self {
        self.steps.push((at, (dx, dy)));
        self.steps.sort_by_key(|(at, _)| *at);
        self
    }

    pub fn offset_at(&self, index: FrameIndex) -> (f64, f64) {
        self.steps
            .iter()
            .take_while(|(at, _)| *at <= index)
            .last()
            .map(|(_, offset)| *offset)
            .unwrap_or((0.0, 0.0))
    }
}

/// Deterministic faults injected by the synthetic sources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FaultPlan {
    glitches: HashMap<(CameraId, FrameIndex), u32>,
    skews: HashMap<FrameIndex, u64>,
}

impl FaultPlan {
    /// The first `failures` reads of `index` from `camera` fail with a decode glitch.
    pub fn glitch(mut self, camera: CameraId, index: FrameIndex, failures: u32) -> Self {
        self.glitches.insert((camera, index), failures);
        self
    }

    /// cam1's timestamp at `index` is late by `skew_ns`.
    pub fn skew(mut self, index: FrameIndex, skew_ns: u64) -> Self {
        self.skews.insert(index, skew_ns);
        self
    }

    fn glitches_for(&self, camera: CameraId) -> HashMap<FrameIndex, u32> {
        self.glitches
            .iter()
            .filter(|((cam, _), _)| *cam == camera)
            .map(|((_, index), failures)| (*index, *failures))
            .collect()
    }
}

/// Two-camera rig over a procedural world.
#[derive(Clone, Debug)]
pub struct SyntheticRig {
    profile_id: String,
    resolution: Resolution,
    overlap_px: u32,
    distortion: Distortion,
    fps: f64,
    frames: u64,
    pan_px_per_frame: f64,
    right_gain: [f64; 3],
    right_bias: [f64; 3],
    exposure_steps: Vec<(FrameIndex, [f64; 3])>,
    drift: DriftSchedule,
    faults: FaultPlan,
}

/// Scene radiance at a world position. Every channel stays within 110 +/- 80.
pub fn world_radiance(x: f64, y: f64) -> [f64; 3] {
    let a = (x * 0.19 + y * 0.05).sin();
    let b = (y * 0.23 - x * 0.07).cos();
    let c = ((x + 2.0 * y) * 0.11).sin();
    [110.0 + 45.0 * a + 35.0 * b, 110.0 + 40.0 * b + 40.0 * c, 110.0 + 50.0 * c + 30.0 * a]
}

fn to_u8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

impl SyntheticRig {
    /// A rig of two `width` x `height` cameras with 20% overlap at 40 fps for 10 seconds.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            profile_id: "synthetic".to_string(),
            resolution: Resolution::new(width, height),
            overlap_px: ((width as f64 * 0.2).round() as u32).max(2),
            distortion: Distortion::default(),
            fps: 40.0,
            frames: 400,
            pan_px_per_frame: 0.5,
            right_gain: [1.0; 3],
            right_bias: [0.0; 3],
            exposure_steps: Vec::new(),
            drift: DriftSchedule::default(),
            faults: FaultPlan::default(),
        }
    }

    pub fn profile_id(mut self, id: impl Into<String>) -> Self {
        self.profile_id = id.into();
        self
    }

    /// Fraction of each camera's width seen by both cameras.
    pub fn overlap_fraction(mut self, fraction: f64) -> Self {
        let w = self.resolution.width;
        self.overlap_px = ((w as f64 * fraction).round() as u32).clamp(2, w.saturating_sub(1).max(2));
        self
    }

    pub fn distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn frames(mut self, frames: u64) -> Self {
        self.frames = frames;
        self
    }

    /// Horizontal scene motion per frame, in world pixels.
    pub fn pan(mut self, px_per_frame: f64) -> Self {
        self.pan_px_per_frame = px_per_frame;
        self
    }

    /// cam1 responds with `gain` relative to cam0 on every channel.
    pub fn right_gain(mut self, gain: f64) -> Self {
        self.right_gain = [gain; 3];
        self
    }

    pub fn right_response(mut self, gain: [f64; 3], bias: [f64; 3]) -> Self {
        self.right_gain = gain;
        self.right_bias = bias;
        self
    }

    /// From frame `at` onward cam1's gain becomes `gain`.
    pub fn exposure_step(mut self, at: FrameIndex, gain: f64) -> Self {
        self.exposure_steps.push((at, [gain; 3]));
        self.exposure_steps.sort_by_key(|(at, _)| *at);
        self
    }

    pub fn drift(mut self, drift: DriftSchedule) -> Self {
        self.drift = drift;
        self
    }

    pub fn faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn overlap_px(&self) -> u32 {
        self.overlap_px
    }

    pub fn panorama(&self) -> Resolution {
        Resolution::new(2 * self.resolution.width - self.overlap_px, self.resolution.height)
    }

    pub fn drift_at(&self, index: FrameIndex) -> (f64, f64) {
        self.drift.offset_at(index)
    }

    pub fn right_gain_at(&self, index: FrameIndex) -> [f64; 3] {
        self.exposure_steps
            .iter()
            .take_while(|(at, _)| *at <= index)
            .last()
            .map(|(_, gain)| *gain)
            .unwrap_or(self.right_gain)
    }

    pub fn timestamp_ns(&self, index: FrameIndex) -> u64 {
        (index as f64 * 1e9 / self.fps).round() as u64
    }

    fn focal(&self) -> f64 {
        self.resolution.width as f64 * 0.9
    }

    fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::centered(self.resolution.width, self.resolution.height, self.focal())
    }

    fn panorama_offset(&self, camera: CameraId) -> f64 {
        if camera == CameraId::LEFT {
            0.0
        } else {
            (self.resolution.width - self.overlap_px) as f64
        }
    }

    /// Calibration matching the rig with zero drift.
    pub fn calibration_document(&self) -> CalibrationDocument {
        let w = self.resolution.width;
        let h = self.resolution.height;
        let o = self.overlap_px;
        let model = |camera: CameraId, overlap: Rect| CameraModel {
            camera,
            raw_resolution: self.resolution,
            intrinsics: self.intrinsics(),
            distortion: self.distortion,
            rectified_intrinsics: self.intrinsics(),
            rectified_resolution: self.resolution,
            to_panorama: [
                [1.0, 0.0, self.panorama_offset(camera)],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            overlap,
        };
        CalibrationDocument {
            profile_id: self.profile_id.clone(),
            panorama: self.panorama(),
            seam: SeamBand {
                start_x: w - o,
                end_x: w,
            },
            cameras: vec![
                model(CameraId::LEFT, Rect::new(w - o, 0, o, h)),
                model(CameraId::RIGHT, Rect::new(0, 0, o, h)),
            ],
        }
    }

    pub fn calibration(&self) -> StitchResult<Arc<CalibrationProfile>> {
        CalibrationProfile::from_document(self.calibration_document()).map(Arc::new)
    }

    /// Rectified position of every raw pixel of a camera.
    fn rectified_positions(&self) -> Arc<Vec<(f64, f64)>> {
        let w = self.resolution.width;
        let h = self.resolution.height;
        let intr = self.intrinsics();
        let distortion = self.distortion;
        let positions = (0..h)
            .into_par_iter()
            .flat_map_iter(move |v| {
                (0..w).map(move |u| {
                    if distortion.is_identity() {
                        return (u as f64, v as f64);
                    }
                    let (xd, yd) = intr.normalize(u as f64, v as f64);
                    let (x, y) = distortion.invert(xd, yd);
                    intr.project(x, y)
                })
            })
            .collect();
        Arc::new(positions)
    }

    fn render_with(&self, camera: CameraId, index: FrameIndex, positions: &[(f64, f64)]) -> Vec<u8> {
        let row = self.resolution.width as usize * 3;
        let mut pixels = vec![0u8; self.resolution.byte_len()];
        let (drift_x, drift_y) = if camera == CameraId::RIGHT {
            self.drift_at(index)
        } else {
            (0.0, 0.0)
        };
        let (gain, bias) = if camera == CameraId::RIGHT {
            (self.right_gain_at(index), self.right_bias)
        } else {
            ([1.0; 3], [0.0; 3])
        };
        let offset_x = self.panorama_offset(camera) + drift_x + self.pan_px_per_frame * index as f64;
        pixels
            .par_chunks_mut(row)
            .zip(positions.par_chunks(self.resolution.width as usize))
            .for_each(|(out, rect_row)| {
                for (px, &(ru, rv)) in out.chunks_exact_mut(3).zip(rect_row) {
                    let radiance = world_radiance(ru + offset_x, rv + drift_y);
                    for c in 0..3 {
                        px[c] = to_u8(gain[c] * radiance[c] + bias[c]);
                    }
                }
            });
        pixels
    }

    /// Renders one camera's raw frame, without faults.
    pub fn render(&self, camera: CameraId, index: FrameIndex) -> RawImage {
        let positions = self.rectified_positions();
        RawImage {
            camera,
            timestamp_ns: self.timestamp_ns(index),
            resolution: self.resolution,
            pixels: self.render_with(camera, index, &positions),
        }
    }

    /// The panorama a perfect stitch of frame `index` would produce, in cam0's exposure.
    pub fn ideal_panorama(&self, index: FrameIndex) -> Vec<u8> {
        let pano = self.panorama();
        let row = pano.width as usize * 3;
        let pan = self.pan_px_per_frame * index as f64;
        let mut pixels = vec![0u8; pano.byte_len()];
        pixels.par_chunks_mut(row).enumerate().for_each(|(y, out)| {
            for (x, px) in out.chunks_exact_mut(3).enumerate() {
                let radiance = world_radiance(x as f64 + pan, y as f64);
                for c in 0..3 {
                    px[c] = to_u8(radiance[c]);
                }
            }
        });
        pixels
    }

    /// Sources for cam0 and cam1 with this rig's fault plan.
    pub fn sources(&self) -> (SyntheticSource, SyntheticSource) {
        let rig = Arc::new(self.clone());
        let positions = self.rectified_positions();
        (
            SyntheticSource::new(Arc::clone(&rig), CameraId::LEFT, Arc::clone(&positions)),
            SyntheticSource::new(rig, CameraId::RIGHT, positions),
        )
    }

    /// Writes both streams as numbered PNG sequences and the calibration profile.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> StitchResult<SyntheticLayout> {
        let dir = dir.as_ref();
        let layout = SyntheticLayout {
            left: dir.join("cam0"),
            right: dir.join("cam1"),
            calibration_dir: dir.join("calibration"),
        };
        let positions = self.rectified_positions();
        for (camera, path) in [(CameraId::LEFT, &layout.left), (CameraId::RIGHT, &layout.right)] {
            std::fs::create_dir_all(path).map_err(|e| StitchError::io_at("create frame dir", path, e))?;
            for index in 0..self.frames {
                let pixels = self.render_with(camera, index, &positions);
                let image = image::RgbImage::from_raw(self.resolution.width, self.resolution.height, pixels)
                    .ok_or_else(|| StitchError::validation("pixels", "buffer matches resolution", self.resolution.to_string()))?;
                image.save(path.join(format!("{index:06}.png")))?;
            }
        }
        CalibrationStore::new(&layout.calibration_dir).save(&self.calibration_document())?;
        info!(
            frames = self.frames,
            resolution = %self.resolution,
            dir = %dir.display(),
            "synthetic rig written"
        );
        Ok(layout)
    }
}

/// Where [`SyntheticRig::write_to`] put its output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticLayout {
    pub left: PathBuf,
    pub right: PathBuf,
    pub calibration_dir: PathBuf,
}

/// One camera of a [`SyntheticRig`].
pub struct SyntheticSource {
    rig: Arc<SyntheticRig>,
    camera: CameraId,
    positions: Arc<Vec<(f64, f64)>>,
    glitches: HashMap<FrameIndex, u32>,
}

impl SyntheticSource {
    fn new(rig: Arc<SyntheticRig>, camera: CameraId, positions: Arc<Vec<(f64, f64)>>) -> Self {
        let glitches = rig.faults.glitches_for(camera);
        Self {
            rig,
            camera,
            positions,
            glitches,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn camera(&self) -> CameraId {
        self.camera
    }

    fn resolution(&self) -> Resolution {
        self.rig.resolution
    }

    fn frame_count(&self) -> u64 {
        self.rig.frames
    }

    fn read_frame(&mut self, index: FrameIndex) -> StitchResult<Option<RawImage>> {
        if index >= self.rig.frames {
            return Ok(None);
        }
        if let Some(remaining) = self.glitches.get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StitchError::source(self.camera, index, "decode glitch"));
            }
        }
        let mut timestamp_ns = self.rig.timestamp_ns(index);
        if self.camera == CameraId::RIGHT {
            timestamp_ns += self.rig.faults.skews.get(&index).copied().unwrap_or(0);
        }
        Ok(Some(RawImage {
            camera: self.camera,
            timestamp_ns,
            resolution: self.rig.resolution,
            pixels: self.rig.render_with(self.camera, index, &self.positions),
        }))
    }
}
