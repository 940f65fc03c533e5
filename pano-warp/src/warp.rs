// SPDX-License-Identifier: MIT
//! # Homographies and Panorama Resampling
//!
//! A camera's calibration carries a homography mapping its rectified pixel coordinates
//! into panorama coordinates. Warping goes backward: each panorama pixel is mapped through
//! the inverse homography into the camera image and sampled bilinearly.

use crate::image::{ImageRef, WarpError, CHANNELS};
use crate::remap::{sample_bilinear, BorderPolicy};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Projective 2D transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self(Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0))
    }

    pub fn from_rows(rows: [[f64; 3]; 3]) -> Self {
        Self(Matrix3::new(
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0], rows[2][1], rows[2][2],
        ))
    }

    pub fn to_rows(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    pub fn inverse(&self) -> Result<Homography, WarpError> {
        self.0.try_inverse().map(Homography).ok_or(WarpError::Singular)
    }

    /// `self` applied after `first`.
    pub fn after(&self, first: &Homography) -> Homography {
        Homography(self.0 * first.0)
    }

    /// This transform followed by a translation of the result.
    pub fn then_translate(&self, dx: f64, dy: f64) -> Homography {
        Homography::translation(dx, dy).after(self)
    }

    /// Maps a point; `None` when it lands on the line at infinity.
    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let v = self.0 * Vector3::new(x, y, 1.0);
        if v.z.abs() < 1e-12 {
            None
        } else {
            Some((v.x / v.z, v.y / v.z))
        }
    }
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

/// A camera image resampled onto the panorama grid, with per-pixel coverage.
#[derive(Clone, Debug)]
pub struct WarpedLayer {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGB, unquantized.
    pub rgb: Vec<f32>,
    pub valid: Vec<bool>,
}

impl WarpedLayer {
    pub fn coverage(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Option<[f32; 3]> {
        let i = y as usize * self.width as usize + x as usize;
        if self.valid[i] {
            let o = i * CHANNELS;
            Some([self.rgb[o], self.rgb[o + 1], self.rgb[o + 2]])
        } else {
            None
        }
    }
}

/// Resamples `src` into a `width` x `height` panorama layer.
///
/// `panorama_to_source` maps panorama coordinates into the source image.
pub fn warp_to_panorama(
    src: &ImageRef<'_>,
    panorama_to_source: &Homography,
    border: BorderPolicy,
    width: u32,
    height: u32,
) -> Result<WarpedLayer, WarpError> {
    if width == 0 || height == 0 {
        return Err(WarpError::Dimensions(format!("panorama {width}x{height}")));
    }
    let w = width as usize;
    let n = w * height as usize;
    let mut rgb = vec![0f32; n * CHANNELS];
    let mut valid = vec![false; n];

    rgb.par_chunks_mut(w * CHANNELS)
        .zip(valid.par_chunks_mut(w))
        .enumerate()
        .for_each(|(y, (rgb_row, valid_row))| {
            for x in 0..w {
                let Some((sx, sy)) = panorama_to_source.apply(x as f64, y as f64) else {
                    continue;
                };
                // Coverage always uses the strict bounds; the border policy only fills.
                let sample = match sample_bilinear(src, sx as f32, sy as f32, BorderPolicy::Black) {
                    Some(px) => Some(px),
                    None if border == BorderPolicy::Clamp && near_image(src, sx, sy) => {
                        sample_bilinear(src, sx as f32, sy as f32, BorderPolicy::Clamp)
                    }
                    None => None,
                };
                if let Some(px) = sample {
                    rgb_row[x * CHANNELS..x * CHANNELS + CHANNELS].copy_from_slice(&px);
                    valid_row[x] = true;
                }
            }
        });

    Ok(WarpedLayer {
        width,
        height,
        rgb,
        valid,
    })
}

/// Within half a pixel of the image, where clamping only repairs rounding at the edge.
fn near_image(src: &ImageRef<'_>, x: f64, y: f64) -> bool {
    x > -0.5 && y > -0.5 && x < src.width as f64 - 0.5 && y < src.height as f64 - 0.5
}
