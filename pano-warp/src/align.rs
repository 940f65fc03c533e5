// SPDX-License-Identifier: MIT
//! # Seam Alignment Search
//!
//! Measures how far the moving camera's content must be translated in panorama space to
//! line up with the reference camera across the seam band. The search evaluates the mean
//! absolute luma difference for every integer offset in a square window around a center,
//! then refines the best offset to sub-pixel precision with an equiangular (V-shaped)
//! fit along each axis.
//!
//! Offset convention: with offset `d`, the moving camera contributes to panorama point `p`
//! the sample its calibration places at `p - d`.

use crate::image::ImageRef;
use crate::remap::{sample_bilinear, BorderPolicy};
use crate::warp::Homography;
use crate::Rect;
use rayon::prelude::*;

/// Fraction of band samples that must be covered by both cameras for a cost to count.
const MIN_COVERAGE: f64 = 0.25;

/// Result of one alignment measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignmentEstimate {
    pub dx: f64,
    pub dy: f64,
    /// Mean absolute luma difference at the best integer offset.
    pub cost: f64,
    /// Mean cost over the window minus the best cost. Near zero on textureless seams.
    pub contrast: f64,
}

/// The two camera images and their panorama mappings, restricted to the seam band.
pub struct SeamProbe<'a> {
    moving: ImageRef<'a>,
    moving_from_panorama: Homography,
    points: Vec<(f64, f64)>,
    reference_luma: Vec<Option<f32>>,
}

#[inline]
fn luma(px: [f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

impl<'a> SeamProbe<'a> {
    /// Samples the reference camera over `band` (panorama coordinates) every `step` pixels.
    pub fn new(
        reference: ImageRef<'a>,
        reference_from_panorama: &Homography,
        moving: ImageRef<'a>,
        moving_from_panorama: Homography,
        band: Rect,
        step: u32,
    ) -> Self {
        let step = step.max(1) as usize;
        let mut points = Vec::new();
        for y in (band.y..band.bottom()).step_by(step) {
            for x in (band.x..band.right()).step_by(step) {
                points.push((x as f64, y as f64));
            }
        }
        let reference_luma = points
            .iter()
            .map(|&(x, y)| {
                let (sx, sy) = reference_from_panorama.apply(x, y)?;
                sample_bilinear(&reference, sx as f32, sy as f32, BorderPolicy::Black).map(luma)
            })
            .collect();
        Self {
            moving,
            moving_from_panorama,
            points,
            reference_luma,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.points.len()
    }

    /// Mean absolute luma difference with the moving camera offset by `(dx, dy)`.
    ///
    /// `None` when too few points are covered by both cameras.
    pub fn cost(&self, dx: f64, dy: f64) -> Option<f64> {
        let mut total = 0f64;
        let mut used = 0usize;
        for (&(x, y), reference) in self.points.iter().zip(&self.reference_luma) {
            let Some(a) = reference else { continue };
            let Some((sx, sy)) = self.moving_from_panorama.apply(x - dx, y - dy) else {
                continue;
            };
            if let Some(b) = sample_bilinear(&self.moving, sx as f32, sy as f32, BorderPolicy::Black) {
                total += (a - luma(b)).abs() as f64;
                used += 1;
            }
        }
        if used == 0 || (used as f64) < self.points.len() as f64 * MIN_COVERAGE {
            None
        } else {
            Some(total / used as f64)
        }
    }
}

/// Equiangular sub-sample offset of a minimum at the middle of three costs.
fn refine(left: Option<f64>, mid: f64, right: Option<f64>) -> f64 {
    let (Some(l), Some(r)) = (left, right) else {
        return 0.0;
    };
    let denom = if l > r { l - mid } else { r - mid };
    if denom <= 1e-9 {
        return 0.0;
    }
    (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
}

/// Searches integer offsets within `radius` of `center` and refines the best one.
///
/// Returns `None` when no candidate has enough overlap coverage.
pub fn estimate_offset(probe: &SeamProbe<'_>, center: (f64, f64), radius: u32) -> Option<AlignmentEstimate> {
    let r = radius as i64;
    let side = (2 * r + 1) as usize;
    let cx = center.0.round();
    let cy = center.1.round();

    let candidates: Vec<(i64, i64)> = (-r..=r).flat_map(|oy| (-r..=r).map(move |ox| (ox, oy))).collect();
    let costs: Vec<Option<f64>> = candidates
        .par_iter()
        .map(|&(ox, oy)| probe.cost(cx + ox as f64, cy + oy as f64))
        .collect();

    let mut best: Option<(usize, f64)> = None;
    let mut sum = 0f64;
    let mut valid = 0usize;
    for (i, cost) in costs.iter().enumerate() {
        if let Some(c) = *cost {
            sum += c;
            valid += 1;
            if best.map_or(true, |(_, b)| c < b) {
                best = Some((i, c));
            }
        }
    }
    let (best_idx, best_cost) = best?;
    let bx = best_idx % side;
    let by = best_idx / side;
    let at = |x: usize, y: usize| costs[y * side + x];

    let sub_x = refine(
        bx.checked_sub(1).and_then(|x| at(x, by)),
        best_cost,
        (bx + 1 < side).then(|| at(bx + 1, by)).flatten(),
    );
    let sub_y = refine(
        by.checked_sub(1).and_then(|y| at(bx, y)),
        best_cost,
        (by + 1 < side).then(|| at(bx, by + 1)).flatten(),
    );

    Some(AlignmentEstimate {
        dx: cx + (bx as i64 - r) as f64 + sub_x,
        dy: cy + (by as i64 - r) as f64 + sub_y,
        cost: best_cost,
        contrast: sum / valid as f64 - best_cost,
    })
}
