// SPDX-License-Identifier: MIT
//! # Seam Blending
//!
//! Composes two [`WarpedLayer`]s into one RGB8 panorama. Inside the seam band the
//! reference layer's weight ramps linearly from 1 to 0 across the band; outside the band
//! the layer that covers a pixel wins outright.
//!
//! ## Methods
//!
//! - **Linear**: per-pixel weighted average with the ramp weights.
//! - **Multi-band**: Laplacian pyramids of both layers are mixed level by level using a
//!   Gaussian pyramid of the ramp, then collapsed. Low frequencies blend over a wide
//!   region while fine detail switches over sharply, hiding exposure residue without
//!   ghosting edges.
//!
//! Pixels covered by neither layer come out black.

use crate::image::{ImageMut, WarpError, CHANNELS};
use crate::remap::quantize;
use crate::warp::WarpedLayer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Seam blending method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Linear,
    MultiBand { levels: u32 },
}

/// Reference-layer weight at panorama column `x` for a seam occupying `band`.
#[inline]
pub fn ramp_weight(x: u32, band: &Range<u32>) -> f32 {
    if x < band.start {
        1.0
    } else if x >= band.end {
        0.0
    } else {
        let width = (band.end - band.start) as f32;
        1.0 - ((x - band.start) as f32 + 0.5) / width
    }
}

#[derive(Clone, Debug)]
struct Plane {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Plane {
    #[inline]
    fn at(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    fn zip_map(&self, other: &Plane, f: impl Fn(f32, f32) -> f32 + Sync + Send) -> Plane {
        let data = self.data.par_iter().zip(other.data.par_iter()).map(|(a, b)| f(*a, *b)).collect();
        Plane {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data,
        }
    }

    /// 2x2 box filter with edge replication.
    fn downsample(&self) -> Plane {
        let width = self.width.div_ceil(2);
        let height = self.height.div_ceil(2);
        let ch = self.channels;
        let mut data = vec![0f32; width * height * ch];
        data.par_chunks_mut(width * ch).enumerate().for_each(|(y, row)| {
            let y0 = 2 * y;
            let y1 = (y0 + 1).min(self.height - 1);
            for x in 0..width {
                let x0 = 2 * x;
                let x1 = (x0 + 1).min(self.width - 1);
                for c in 0..ch {
                    row[x * ch + c] =
                        0.25 * (self.at(x0, y0, c) + self.at(x1, y0, c) + self.at(x0, y1, c) + self.at(x1, y1, c));
                }
            }
        });
        Plane {
            width,
            height,
            channels: ch,
            data,
        }
    }

    /// Bilinear expansion to `width` x `height`, pixel-center aligned.
    fn upsample(&self, width: usize, height: usize) -> Plane {
        let ch = self.channels;
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let mut data = vec![0f32; width * height * ch];
        data.par_chunks_mut(width * ch).enumerate().for_each(|(y, row)| {
            let sy = ((y as f32 + 0.5) / 2.0 - 0.5).clamp(0.0, max_y);
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let fy = sy - y0 as f32;
            for x in 0..width {
                let sx = ((x as f32 + 0.5) / 2.0 - 0.5).clamp(0.0, max_x);
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let fx = sx - x0 as f32;
                for c in 0..ch {
                    let top = self.at(x0, y0, c) * (1.0 - fx) + self.at(x1, y0, c) * fx;
                    let bottom = self.at(x0, y1, c) * (1.0 - fx) + self.at(x1, y1, c) * fx;
                    row[x * ch + c] = top * (1.0 - fy) + bottom * fy;
                }
            }
        });
        Plane {
            width,
            height,
            channels: ch,
            data,
        }
    }
}

fn gaussian_pyramid(base: Plane, levels: usize) -> Vec<Plane> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(base);
    while pyramid.len() < levels {
        let next = pyramid[pyramid.len() - 1].downsample();
        pyramid.push(next);
    }
    pyramid
}

fn laplacian_pyramid(base: Plane, levels: usize) -> Vec<Plane> {
    let gaussian = gaussian_pyramid(base, levels);
    let mut out = Vec::with_capacity(levels);
    for i in 0..levels - 1 {
        let expanded = gaussian[i + 1].upsample(gaussian[i].width, gaussian[i].height);
        out.push(gaussian[i].zip_map(&expanded, |g, e| g - e));
    }
    out.push(gaussian[levels - 1].clone());
    out
}

/// Pyramid depth actually usable for an image of the given size.
pub fn effective_levels(requested: u32, width: u32, height: u32) -> usize {
    let smallest = width.min(height).max(1);
    let max_levels = (u32::BITS - smallest.leading_zeros()) as usize;
    (requested as usize).clamp(1, max_levels)
}

/// Blends `reference` and `moving` into `dst`.
///
/// # Errors
///
/// [`WarpError::Dimensions`] when the layers and destination disagree in size.
pub fn blend_layers(
    reference: &WarpedLayer,
    moving: &WarpedLayer,
    band: Range<u32>,
    mode: BlendMode,
    dst: &mut ImageMut<'_>,
) -> Result<(), WarpError> {
    if reference.width != moving.width
        || reference.height != moving.height
        || reference.width != dst.width
        || reference.height != dst.height
    {
        return Err(WarpError::Dimensions(format!(
            "blend layers {}x{} / {}x{} into {}x{}",
            reference.width, reference.height, moving.width, moving.height, dst.width, dst.height
        )));
    }

    let width = reference.width as usize;
    let height = reference.height as usize;
    let n = width * height;
    let mut a = reference.rgb.clone();
    let mut b = moving.rgb.clone();
    let mut weight = vec![0f32; n];
    let mut covered = vec![true; n];

    for i in 0..n {
        let x = (i % width) as u32;
        let o = i * CHANNELS;
        match (reference.valid[i], moving.valid[i]) {
            (true, true) => weight[i] = ramp_weight(x, &band),
            (true, false) => {
                weight[i] = 1.0;
                b[o..o + CHANNELS].copy_from_slice(&reference.rgb[o..o + CHANNELS]);
            }
            (false, true) => {
                weight[i] = 0.0;
                a[o..o + CHANNELS].copy_from_slice(&moving.rgb[o..o + CHANNELS]);
            }
            (false, false) => {
                weight[i] = 0.5;
                covered[i] = false;
            }
        }
    }

    let blended = match mode {
        BlendMode::MultiBand { levels } if effective_levels(levels, reference.width, reference.height) > 1 => {
            let levels = effective_levels(levels, reference.width, reference.height);
            multiband(a, b, weight, width, height, levels)
        }
        _ => {
            let mut out = vec![0f32; n * CHANNELS];
            for i in 0..n {
                let w = weight[i];
                for c in 0..CHANNELS {
                    let o = i * CHANNELS + c;
                    out[o] = w * a[o] + (1.0 - w) * b[o];
                }
            }
            out
        }
    };

    for i in 0..n {
        let o = i * CHANNELS;
        for c in 0..CHANNELS {
            dst.data[o + c] = if covered[i] { quantize(blended[o + c]) } else { 0 };
        }
    }
    Ok(())
}

fn multiband(a: Vec<f32>, b: Vec<f32>, weight: Vec<f32>, width: usize, height: usize, levels: usize) -> Vec<f32> {
    let plane = |data: Vec<f32>, channels: usize| Plane {
        width,
        height,
        channels,
        data,
    };
    let la = laplacian_pyramid(plane(a, CHANNELS), levels);
    let lb = laplacian_pyramid(plane(b, CHANNELS), levels);
    let masks = gaussian_pyramid(plane(weight, 1), levels);

    let mixed: Vec<Plane> = la
        .iter()
        .zip(&lb)
        .zip(&masks)
        .map(|((pa, pb), mask)| {
            let mut out = pa.clone();
            out.data
                .par_chunks_mut(CHANNELS)
                .zip(pb.data.par_chunks(CHANNELS))
                .zip(mask.data.par_iter())
                .for_each(|((o, bv), w)| {
                    for c in 0..CHANNELS {
                        o[c] = w * o[c] + (1.0 - w) * bv[c];
                    }
                });
            out
        })
        .collect();

    let mut result = mixed[levels - 1].clone();
    for level in mixed[..levels - 1].iter().rev() {
        let expanded = result.upsample(level.width, level.height);
        result = expanded.zip_map(level, |e, l| e + l);
    }
    result.data
}
