// SPDX-License-Identifier: MIT
//! Per-channel statistics over image regions and affine color correction.

use crate::image::{ImageMut, ImageRef, Rect, WarpError, CHANNELS};
use crate::remap::quantize;
use rayon::prelude::*;

/// Mean and population variance of each channel over a region.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub mean: [f64; 3],
    pub variance: [f64; 3],
    pub count: u64,
}

impl ChannelStats {
    pub fn std_dev(&self) -> [f64; 3] {
        self.variance.map(f64::sqrt)
    }

    pub fn min_variance(&self) -> f64 {
        self.variance.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

#[derive(Clone, Copy, Default)]
struct Moments {
    sum: [f64; 3],
    sum_sq: [f64; 3],
}

/// Computes [`ChannelStats`] of `img` inside `region`.
///
/// Rows are summed in parallel and folded in row order, so the result does not depend
/// on the thread count.
pub fn channel_stats(img: &ImageRef<'_>, region: Rect) -> Result<ChannelStats, WarpError> {
    region.check(img.width, img.height)?;
    let rows: Vec<Moments> = (region.y..region.bottom())
        .into_par_iter()
        .map(|y| {
            let mut m = Moments::default();
            for x in region.x..region.right() {
                let px = img.pixel(x, y);
                for c in 0..CHANNELS {
                    let v = px[c] as f64;
                    m.sum[c] += v;
                    m.sum_sq[c] += v * v;
                }
            }
            m
        })
        .collect();

    let mut total = Moments::default();
    for row in &rows {
        for c in 0..CHANNELS {
            total.sum[c] += row.sum[c];
            total.sum_sq[c] += row.sum_sq[c];
        }
    }

    let count = region.area();
    let n = count as f64;
    let mut stats = ChannelStats {
        count,
        ..ChannelStats::default()
    };
    for c in 0..CHANNELS {
        let mean = total.sum[c] / n;
        stats.mean[c] = mean;
        stats.variance[c] = (total.sum_sq[c] / n - mean * mean).max(0.0);
    }
    Ok(stats)
}

/// Writes `gain * src + bias` per channel into `dst`, saturating to 8 bits.
pub fn apply_gain_bias(
    src: &ImageRef<'_>,
    gain: [f64; 3],
    bias: [f64; 3],
    dst: &mut ImageMut<'_>,
) -> Result<(), WarpError> {
    if src.width != dst.width || src.height != dst.height {
        return Err(WarpError::Dimensions(format!(
            "gain/bias source {}x{} vs destination {}x{}",
            src.width, src.height, dst.width, dst.height
        )));
    }
    let gain = gain.map(|g| g as f32);
    let bias = bias.map(|b| b as f32);
    let row = src.row_bytes();
    dst.data
        .par_chunks_mut(row)
        .zip(src.data.par_chunks(row))
        .for_each(|(out, input)| {
            for (o, i) in out.chunks_exact_mut(CHANNELS).zip(input.chunks_exact(CHANNELS)) {
                for c in 0..CHANNELS {
                    o[c] = quantize(gain[c] * i[c] as f32 + bias[c]);
                }
            }
        });
    Ok(())
}
