// SPDX-License-Identifier: MIT
//! # Table-Driven Remapping
//!
//! Backward mapping: for every destination pixel the table names the source coordinate
//! to sample. Sampling is bilinear over the four neighbouring source pixels.
//!
//! ## Border Policy
//!
//! A coordinate is outside the source when `x < 0`, `y < 0`, `x > width - 1` or
//! `y > height - 1`. [`BorderPolicy::Black`] produces black (and reports "no sample"
//! to callers that care about coverage); [`BorderPolicy::Clamp`] repeats the nearest
//! edge pixel.

use crate::image::{ImageMut, ImageRef, WarpError, CHANNELS};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// What to produce for samples that fall outside the source image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderPolicy {
    #[default]
    Black,
    Clamp,
}

/// Per-pixel source coordinates for a `width` x `height` destination.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    pub width: u32,
    pub height: u32,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

impl RemapTable {
    pub fn new(width: u32, height: u32, map_x: Vec<f32>, map_y: Vec<f32>) -> Result<Self, WarpError> {
        let n = width as usize * height as usize;
        if n == 0 || map_x.len() != n || map_y.len() != n {
            return Err(WarpError::Dimensions(format!(
                "remap table {width}x{height} with {} / {} entries",
                map_x.len(),
                map_y.len()
            )));
        }
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    /// Table that samples every destination pixel from the same source position.
    pub fn identity(width: u32, height: u32) -> Self {
        let n = width as usize * height as usize;
        let mut map_x = Vec::with_capacity(n);
        let mut map_y = Vec::with_capacity(n);
        for y in 0..height {
            for x in 0..width {
                map_x.push(x as f32);
                map_y.push(y as f32);
            }
        }
        Self {
            width,
            height,
            map_x,
            map_y,
        }
    }

    pub fn len(&self) -> usize {
        self.map_x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_x.is_empty()
    }
}

/// Rounds and saturates a filtered value back to 8 bits.
#[inline]
pub fn quantize(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Bilinear sample at a fractional source position.
///
/// Returns `None` when the position is outside the image under [`BorderPolicy::Black`]
/// or is not finite.
#[inline]
pub fn sample_bilinear(src: &ImageRef<'_>, x: f32, y: f32, border: BorderPolicy) -> Option<[f32; 3]> {
    let max_x = (src.width - 1) as f32;
    let max_y = (src.height - 1) as f32;
    let (x, y) = match border {
        BorderPolicy::Black => {
            if !(x >= 0.0 && y >= 0.0 && x <= max_x && y <= max_y) {
                return None;
            }
            (x, y)
        }
        BorderPolicy::Clamp => {
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            (x.clamp(0.0, max_x), y.clamp(0.0, max_y))
        }
    };

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(src.width - 1);
    let y1 = (y0 + 1).min(src.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.pixel(x0, y0);
    let p10 = src.pixel(x1, y0);
    let p01 = src.pixel(x0, y1);
    let p11 = src.pixel(x1, y1);

    let mut out = [0f32; 3];
    for c in 0..CHANNELS {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// Remaps `src` into `dst` through `table`.
///
/// # Errors
///
/// Returns [`WarpError::Dimensions`] when `dst` does not match the table size.
pub fn remap_rgb(
    src: &ImageRef<'_>,
    table: &RemapTable,
    border: BorderPolicy,
    dst: &mut ImageMut<'_>,
) -> Result<(), WarpError> {
    if dst.width != table.width || dst.height != table.height {
        return Err(WarpError::Dimensions(format!(
            "destination {}x{} does not match remap table {}x{}",
            dst.width, dst.height, table.width, table.height
        )));
    }
    let width = table.width as usize;
    dst.data
        .par_chunks_mut(width * CHANNELS)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let idx = y * width + x;
                let px = sample_bilinear(src, table.map_x[idx], table.map_y[idx], border).unwrap_or([0.0; 3]);
                let o = x * CHANNELS;
                row[o] = quantize(px[0]);
                row[o + 1] = quantize(px[1]);
                row[o + 2] = quantize(px[2]);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(crate::byte_len(width, height));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 10) as u8, (y * 10) as u8, 77]);
            }
        }
        data
    }

    #[test]
    fn test_bilinear_interpolates_between_neighbours() {
        let data = gradient(4, 4);
        let img = ImageRef::new(&data, 4, 4).unwrap();
        let px = sample_bilinear(&img, 1.5, 2.25, BorderPolicy::Black).unwrap();
        assert!((px[0] - 15.0).abs() < 1e-4);
        assert!((px[1] - 22.5).abs() < 1e-4);
        assert!((px[2] - 77.0).abs() < 1e-4);
    }

    #[test]
    fn test_black_border_rejects_outside_and_accepts_last_pixel() {
        let data = gradient(4, 4);
        let img = ImageRef::new(&data, 4, 4).unwrap();
        assert!(sample_bilinear(&img, -0.01, 1.0, BorderPolicy::Black).is_none());
        assert!(sample_bilinear(&img, 3.01, 1.0, BorderPolicy::Black).is_none());
        assert!(sample_bilinear(&img, f32::NAN, 1.0, BorderPolicy::Black).is_none());
        let last = sample_bilinear(&img, 3.0, 3.0, BorderPolicy::Black).unwrap();
        assert_eq!(last[0], 30.0);
    }

    #[test]
    fn test_clamp_border_repeats_edge() {
        let data = gradient(4, 4);
        let img = ImageRef::new(&data, 4, 4).unwrap();
        let px = sample_bilinear(&img, -5.0, 10.0, BorderPolicy::Clamp).unwrap();
        assert_eq!(px[0], 0.0);
        assert_eq!(px[1], 30.0);
    }

    #[test]
    fn test_identity_remap_is_lossless() {
        let src = gradient(6, 5);
        let mut dst = vec![0u8; src.len()];
        let table = RemapTable::identity(6, 5);
        let src_img = ImageRef::new(&src, 6, 5).unwrap();
        let mut dst_img = ImageMut::new(&mut dst, 6, 5).unwrap();
        remap_rgb(&src_img, &table, BorderPolicy::Black, &mut dst_img).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_shifted_remap_blackens_uncovered_columns() {
        let src = gradient(6, 2);
        let mut dst = vec![255u8; src.len()];
        let mut table = RemapTable::identity(6, 2);
        for v in table.map_x.iter_mut() {
            *v += 2.0;
        }
        let src_img = ImageRef::new(&src, 6, 2).unwrap();
        let mut dst_img = ImageMut::new(&mut dst, 6, 2).unwrap();
        remap_rgb(&src_img, &table, BorderPolicy::Black, &mut dst_img).unwrap();
        assert_eq!(&dst[0..3], &src[6..9]);
        assert_eq!(&dst[12..18], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_remap_rejects_mismatched_destination() {
        let src = gradient(4, 4);
        let mut dst = vec![0u8; crate::byte_len(3, 4)];
        let src_img = ImageRef::new(&src, 4, 4).unwrap();
        let mut dst_img = ImageMut::new(&mut dst, 3, 4).unwrap();
        let table = RemapTable::identity(4, 4);
        assert!(remap_rgb(&src_img, &table, BorderPolicy::Black, &mut dst_img).is_err());
    }
}
