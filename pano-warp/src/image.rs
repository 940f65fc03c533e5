// SPDX-License-Identifier: MIT
//! Borrowed RGB8 image views and the crate error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Interleaved channels per pixel (RGB8).
pub const CHANNELS: usize = 3;

/// Errors raised by kernel argument validation.
#[derive(Debug, Clone, PartialEq)]
pub enum WarpError {
    /// A pixel buffer does not match its declared dimensions.
    BufferSize { expected: usize, actual: usize },
    /// Image or table dimensions are zero or inconsistent with each other.
    Dimensions(String),
    /// A region lies (partly) outside its image.
    Region { rect: Rect, width: u32, height: u32 },
    /// A homography has no inverse.
    Singular,
}

impl fmt::Display for WarpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarpError::BufferSize { expected, actual } => {
                write!(f, "buffer holds {actual} bytes, expected {expected}")
            }
            WarpError::Dimensions(msg) => write!(f, "invalid dimensions: {msg}"),
            WarpError::Region { rect, width, height } => write!(
                f,
                "region {}x{}+{}+{} exceeds {width}x{height} image",
                rect.width, rect.height, rect.x, rect.y
            ),
            WarpError::Singular => write!(f, "homography is singular"),
        }
    }
}

impl std::error::Error for WarpError {}

/// Byte length of a tightly-packed RGB8 image.
#[inline]
pub fn byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

fn check_len(len: usize, width: u32, height: u32) -> Result<(), WarpError> {
    if width == 0 || height == 0 {
        return Err(WarpError::Dimensions(format!("{width}x{height}")));
    }
    let expected = byte_len(width, height);
    if len != expected {
        return Err(WarpError::BufferSize { expected, actual: len });
    }
    Ok(())
}

/// Read-only view of a tightly-packed RGB8 image.
#[derive(Clone, Copy, Debug)]
pub struct ImageRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> ImageRef<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self, WarpError> {
        check_len(data.len(), width, height)?;
        Ok(Self { data, width, height })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let o = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[o], self.data[o + 1], self.data[o + 2]]
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * CHANNELS
    }
}

/// Mutable view of a tightly-packed RGB8 image.
#[derive(Debug)]
pub struct ImageMut<'a> {
    pub data: &'a mut [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> ImageMut<'a> {
    pub fn new(data: &'a mut [u8], width: u32, height: u32) -> Result<Self, WarpError> {
        check_len(data.len(), width, height)?;
        Ok(Self { data, width, height })
    }

    pub fn view(&self) -> ImageRef<'_> {
        ImageRef {
            data: &*self.data,
            width: self.width,
            height: self.height,
        }
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies entirely inside a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        !self.is_empty()
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub(crate) fn check(&self, width: u32, height: u32) -> Result<(), WarpError> {
        if self.fits_within(width, height) {
            Ok(())
        } else {
            Err(WarpError::Region {
                rect: *self,
                width,
                height,
            })
        }
    }
}
