// SPDX-License-Identifier: MIT
//! # pano-warp: Pixel Kernels for Dual-Camera Panorama Stitching
//!
//! This crate holds the per-pixel work of the stitching engine: lens-correction remaps,
//! homography resampling into panorama space, overlap color statistics, seam alignment
//! search and seam blending. Every kernel operates on tightly-packed RGB8 images described
//! by [`ImageRef`] / [`ImageMut`] and never allocates device state of its own; callers own
//! the buffers.
//!
//! ## Key Components
//!
//! - [`remap`]: bilinear sampling with a border policy and table-driven remapping
//! - [`lut`]: Brown-Conrady lens model and undistortion table construction
//! - [`warp`]: homographies and resampling of a camera image into panorama space
//! - [`stats`]: per-channel mean/variance over a region, gain/bias correction
//! - [`align`]: seam-band alignment search with sub-pixel refinement
//! - [`blend`]: linear feathering and Laplacian multi-band seam blending
//!
//! ## Determinism
//!
//! Row work is spread across the rayon pool, but every reduction is folded in row order on
//! a single thread. Identical inputs therefore produce bit-identical outputs regardless of
//! how many worker threads are available, which is what makes checkpoint resume exact.
//!
//! ## Usage Example
//!
//! ```rust
//! use pano_warp::{ImageMut, ImageRef};
//! use pano_warp::remap::{remap_rgb, BorderPolicy, RemapTable};
//!
//! let src = vec![128u8; 8 * 4 * 3];
//! let mut dst = vec![0u8; 8 * 4 * 3];
//! let table = RemapTable::identity(8, 4);
//! let src_img = ImageRef::new(&src, 8, 4)?;
//! let mut dst_img = ImageMut::new(&mut dst, 8, 4)?;
//! remap_rgb(&src_img, &table, BorderPolicy::Black, &mut dst_img)?;
//! assert_eq!(src, dst);
//! # Ok::<(), pano_warp::WarpError>(())
//! ```

pub mod align;
pub mod blend;
pub mod image;
pub mod lut;
pub mod remap;
pub mod stats;
pub mod warp;

pub use image::{byte_len, ImageMut, ImageRef, Rect, WarpError, CHANNELS};
