//! Recorded camera streams stored as numbered still images.
//!
//! A directory holds one file per frame (`000000.png`, `000001.png`, ...). Files are
//! ordered by name; the frame rate turns positions into capture timestamps.

use crate::capture::FrameSource;
use crate::core::frame::{CameraId, FrameIndex, RawImage, Resolution};
use crate::error::{StitchError, StitchResult};
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One camera's image sequence on disk.
#[derive(Debug)]
pub struct ImageSequenceSource {
    camera: CameraId,
    files: Vec<PathBuf>,
    resolution: Resolution,
    fps: f64,
}

impl ImageSequenceSource {
    /// Indexes `dir` and probes the first frame for the stream resolution.
    pub fn open(dir: impl AsRef<Path>, camera: CameraId, fps: f64) -> StitchResult<Self> {
        let dir = dir.as_ref();
        if !(fps.is_finite() && fps > 0.0) {
            return Err(StitchError::config("fps", fps.to_string(), "source frame rate must be positive"));
        }
        let entries = std::fs::read_dir(dir).map_err(|e| StitchError::io_at("list image sequence", dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StitchError::io_at("list image sequence", dir, e))?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        let Some(first) = files.first() else {
            return Err(StitchError::source(camera, 0, format!("no frames in {}", dir.display())).escalate("empty stream"));
        };
        let (width, height) = image::image_dimensions(first)?;
        debug!(camera = %camera, frames = files.len(), dir = %dir.display(), "image sequence indexed");
        Ok(Self {
            camera,
            files,
            resolution: Resolution::new(width, height),
            fps,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn camera(&self) -> CameraId {
        self.camera
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn frame_count(&self) -> u64 {
        self.files.len() as u64
    }

    fn read_frame(&mut self, index: FrameIndex) -> StitchResult<Option<RawImage>> {
        let Some(path) = usize::try_from(index).ok().and_then(|i| self.files.get(i)) else {
            return Ok(None);
        };
        let decoded = image::open(path)
            .map_err(|e| StitchError::source(self.camera, index, format!("{}: {e}", path.display())))?
            .to_rgb8();
        let resolution = Resolution::new(decoded.width(), decoded.height());
        if resolution != self.resolution {
            return Err(StitchError::source(
                self.camera,
                index,
                format!("{} is {resolution}, stream is {}", path.display(), self.resolution),
            ));
        }
        Ok(Some(RawImage {
            camera: self.camera,
            timestamp_ns: (index as f64 * 1e9 / self.fps).round() as u64,
            resolution,
            pixels: decoded.into_raw(),
        }))
    }
}
