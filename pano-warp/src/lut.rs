// SPDX-License-Identifier: MIT
//! # Lens Model and Undistortion Tables
//!
//! Brown-Conrady distortion (three radial, two tangential terms) over normalized camera
//! coordinates. [`init_undistort_map`] precomputes, for every rectified pixel, the raw
//! sensor position to sample, so per-frame undistortion is a single [`remap_rgb`] pass.
//!
//! [`remap_rgb`]: crate::remap::remap_rgb

use crate::image::WarpError;
use crate::remap::RemapTable;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Square-pixel camera with the principal point at the image center.
    pub fn centered(width: u32, height: u32, focal: f64) -> Self {
        Self {
            fx: focal,
            fy: focal,
            cx: (width as f64 - 1.0) / 2.0,
            cy: (height as f64 - 1.0) / 2.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fx.is_finite() && self.fy.is_finite() && self.fx > 0.0 && self.fy > 0.0 && self.cx.is_finite() && self.cy.is_finite()
    }

    #[inline]
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    #[inline]
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }
}

/// Brown-Conrady distortion coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
}

impl Distortion {
    pub fn radial(k1: f64, k2: f64) -> Self {
        Self {
            k1,
            k2,
            ..Self::default()
        }
    }

    pub fn is_identity(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0 && self.k3 == 0.0
    }

    /// Maps an ideal normalized point to where the lens actually images it.
    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Inverts [`Distortion::apply`] by fixed-point iteration.
    ///
    /// Converges for the mild distortion of broadcast lenses; strongly distorted
    /// fisheye models are out of scope.
    pub fn invert(&self, xd: f64, yd: f64) -> (f64, f64) {
        if self.is_identity() {
            return (xd, yd);
        }
        let (mut x, mut y) = (xd, yd);
        for _ in 0..32 {
            let (ex, ey) = self.apply(x, y);
            let (dx, dy) = (xd - ex, yd - ey);
            x += dx;
            y += dy;
            if dx.abs() < 1e-12 && dy.abs() < 1e-12 {
                break;
            }
        }
        (x, y)
    }
}

/// Builds the rectified -> raw lookup table for one camera.
///
/// # Parameters
///
/// - `raw`: intrinsics of the physical sensor
/// - `distortion`: lens coefficients of the physical sensor
/// - `rectified`: intrinsics of the ideal output camera
/// - `width`, `height`: rectified output size
///
/// # Errors
///
/// [`WarpError::Dimensions`] for an empty output or invalid intrinsics.
pub fn init_undistort_map(
    raw: &CameraIntrinsics,
    distortion: &Distortion,
    rectified: &CameraIntrinsics,
    width: u32,
    height: u32,
) -> Result<RemapTable, WarpError> {
    if width == 0 || height == 0 {
        return Err(WarpError::Dimensions(format!("rectified size {width}x{height}")));
    }
    if !raw.is_valid() || !rectified.is_valid() {
        return Err(WarpError::Dimensions("focal lengths must be positive and finite".into()));
    }
    if distortion.is_identity() && raw == rectified {
        return Ok(RemapTable::identity(width, height));
    }

    let w = width as usize;
    let n = w * height as usize;
    let mut map_x = vec![0f32; n];
    let mut map_y = vec![0f32; n];

    map_x
        .par_chunks_mut(w)
        .zip(map_y.par_chunks_mut(w))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..w {
                let (xn, yn) = rectified.normalize(x as f64, y as f64);
                let (xd, yd) = distortion.apply(xn, yn);
                let (u, v) = raw.project(xd, yd);
                row_x[x] = u as f32;
                row_y[x] = v as f32;
            }
        });

    RemapTable::new(width, height, map_x, map_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distortion_with_same_intrinsics_is_identity() {
        let k = CameraIntrinsics::centered(16, 8, 20.0);
        let table = init_undistort_map(&k, &Distortion::default(), &k, 16, 8).unwrap();
        let identity = RemapTable::identity(16, 8);
        for (a, b) in table.map_x.iter().zip(identity.map_x.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        for (a, b) in table.map_y.iter().zip(identity.map_y.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_barrel_distortion_pulls_corners_inward() {
        let k = CameraIntrinsics::centered(64, 48, 60.0);
        let table = init_undistort_map(&k, &Distortion::radial(-0.2, 0.0), &k, 64, 48).unwrap();
        // Rectified corner samples a raw position closer to the center.
        assert!(table.map_x[0] > 0.0);
        assert!(table.map_y[0] > 0.0);
        let center = 24 * 64 + 32;
        assert!((table.map_x[center] - 32.0).abs() < 0.1);
    }

    #[test]
    fn test_invert_round_trips_apply() {
        let d = Distortion {
            k1: -0.12,
            k2: 0.03,
            p1: 0.001,
            p2: -0.0005,
            k3: 0.0,
        };
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.5, 0.4)] {
            let (xd, yd) = d.apply(x, y);
            let (xi, yi) = d.invert(xd, yd);
            assert!((xi - x).abs() < 1e-9, "x {x} -> {xi}");
            assert!((yi - y).abs() < 1e-9, "y {y} -> {yi}");
        }
    }

    #[test]
    fn test_rejects_degenerate_intrinsics() {
        let mut k = CameraIntrinsics::centered(8, 8, 10.0);
        k.fx = 0.0;
        assert!(init_undistort_map(&k, &Distortion::default(), &k, 8, 8).is_err());
    }
}
