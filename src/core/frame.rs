//! # Frame Data Model
//!
//! Camera identities, resolutions and per-frame flags, plus the device-resident
//! [`Frame`] and [`FramePair`] that flow between pipeline stages.
//!
//! A [`Frame`] is immutable once published: its buffer lease is shared behind an `Arc`, so
//! a stage that passes a frame through unchanged clones the handle instead of copying
//! pixels. The buffer goes back to its pool when the last holder drops it.

use crate::core::buffer_pool::{BufferLease, MemoryManager, SizeClass};
use crate::core::device::DeviceContext;
use crate::error::{StitchError, StitchResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Sequential frame number within a job, starting at zero.
pub type FrameIndex = u64;

/// Identifies one physical camera of the rig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u8);

impl CameraId {
    /// The reference camera; the other camera is color-matched to it.
    pub const LEFT: CameraId = CameraId(0);
    pub const RIGHT: CameraId = CameraId(1);
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes of a tightly-packed RGB8 image at this resolution.
    pub fn byte_len(&self) -> usize {
        pano_warp::byte_len(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Why a delivered frame is of reduced quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// Seam alignment fell back to the calibrated default
    DriftFallback,
    /// Overlap lacked texture; the previous color estimate was reused
    ColorEstimateStale,
}

/// Why a frame was replaced by a missing marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    /// A camera failed to deliver the frame
    SourceFault,
    /// The pair's capture timestamps were too far apart
    SyncRejected,
    /// No device buffer became available in time
    BufferStarved,
    /// A stage kept failing on the frame
    StageFault,
}

/// Per-frame quality annotations carried to the encoder and quality tap.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<MissingReason>,
}

impl FrameFlags {
    pub fn missing(reason: MissingReason) -> Self {
        Self {
            degraded: Vec::new(),
            missing: Some(reason),
        }
    }

    pub fn mark_degraded(&mut self, reason: DegradedReason) {
        if !self.degraded.contains(&reason) {
            self.degraded.push(reason);
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn is_missing(&self) -> bool {
        self.missing.is_some()
    }
}

/// A camera frame in host memory, as delivered by a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub camera: CameraId,
    /// Capture time in nanoseconds on the rig clock
    pub timestamp_ns: u64,
    pub resolution: Resolution,
    /// Tightly-packed RGB8
    pub pixels: Vec<u8>,
}

impl RawImage {
    pub fn validate(&self) -> StitchResult<()> {
        if self.pixels.len() != self.resolution.byte_len() {
            return Err(StitchError::validation(
                "pixels",
                format!("{} RGB8 frame needs {} bytes", self.resolution, self.resolution.byte_len()),
                self.pixels.len().to_string(),
            ));
        }
        Ok(())
    }
}

/// An immutable frame resident in device memory.
#[derive(Clone, Debug)]
pub struct Frame {
    pub camera: CameraId,
    pub timestamp_ns: u64,
    pub resolution: Resolution,
    pub buffer: Arc<BufferLease>,
}

impl Frame {
    pub fn new(camera: CameraId, timestamp_ns: u64, resolution: Resolution, buffer: BufferLease) -> Self {
        Self {
            camera,
            timestamp_ns,
            resolution,
            buffer: Arc::new(buffer),
        }
    }

    /// Copies a host image into a freshly leased device buffer of `class`.
    pub fn upload(
        device: &DeviceContext,
        memory: &Arc<MemoryManager>,
        class: SizeClass,
        image: RawImage,
    ) -> StitchResult<Frame> {
        image.validate()?;
        let lease = memory.acquire(class)?;
        Self::upload_into(device, lease, image)
    }

    /// Copies a host image into an already leased device buffer.
    pub fn upload_into(device: &DeviceContext, lease: BufferLease, image: RawImage) -> StitchResult<Frame> {
        image.validate()?;
        if lease.len() != image.pixels.len() {
            return Err(StitchError::calibration(
                "active",
                format!(
                    "{} frame from {} does not fit {} buffers of {} bytes",
                    image.resolution,
                    image.camera,
                    lease.size_class(),
                    lease.len()
                ),
            ));
        }
        let slab = lease.memory();
        let RawImage {
            camera,
            timestamp_ns,
            resolution,
            pixels,
        } = image;
        let fence = device.submit("upload", move || {
            let mut dst = slab.write().map_err(|_| StitchError::poisoned("buffer"))?;
            dst.copy_from_slice(&pixels);
            Ok(())
        })?;
        lease.record_use(&fence);
        fence.wait()?;
        Ok(Frame::new(camera, timestamp_ns, resolution, lease))
    }

    /// Copies the frame back to host memory.
    pub fn download(&self) -> StitchResult<Vec<u8>> {
        let bytes = self.buffer.read()?;
        Ok(bytes[..self.resolution.byte_len()].to_vec())
    }
}

/// Absolute difference of two capture timestamps.
pub fn skew_ns(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

/// Two frames from distinct cameras captured within the sync tolerance.
#[derive(Clone, Debug)]
pub struct FramePair {
    pub left: Frame,
    pub right: Frame,
}

impl FramePair {
    /// Pairs two frames, enforcing distinct cameras and the sync tolerance.
    pub fn new(index: FrameIndex, left: Frame, right: Frame, tolerance_ns: u64) -> StitchResult<Self> {
        if left.camera == right.camera {
            return Err(StitchError::validation(
                "frame_pair",
                "frames must come from distinct cameras",
                left.camera.to_string(),
            ));
        }
        let skew = skew_ns(left.timestamp_ns, right.timestamp_ns);
        if skew >= tolerance_ns {
            return Err(StitchError::sync(index, skew, tolerance_ns));
        }
        Ok(Self { left, right })
    }

    /// Pairing timestamp: the earlier of the two captures.
    pub fn timestamp_ns(&self) -> u64 {
        self.left.timestamp_ns.min(self.right.timestamp_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceId;
    use std::time::Duration;

    fn setup() -> (Arc<DeviceContext>, Arc<MemoryManager>) {
        let device = DeviceContext::new(DeviceId(0)).unwrap();
        let memory = MemoryManager::new(8, Duration::from_millis(200));
        memory.configure_class(SizeClass::Raw, 4 * 2 * 3, 4).unwrap();
        (device, memory)
    }

    fn image(camera: CameraId, ts: u64, value: u8) -> RawImage {
        RawImage {
            camera,
            timestamp_ns: ts,
            resolution: Resolution::new(4, 2),
            pixels: vec![value; 24],
        }
    }

    #[test]
    fn test_upload_round_trips_pixels() {
        let (device, memory) = setup();
        let frame = Frame::upload(&device, &memory, SizeClass::Raw, image(CameraId::LEFT, 10, 42)).unwrap();
        assert_eq!(frame.download().unwrap(), vec![42; 24]);
        assert_eq!(memory.stats(SizeClass::Raw).unwrap().in_use, 1);
        drop(frame);
        assert_eq!(memory.stats(SizeClass::Raw).unwrap().in_use, 0);
    }

    #[test]
    fn test_upload_rejects_wrong_length() {
        let (device, memory) = setup();
        let mut img = image(CameraId::LEFT, 0, 1);
        img.pixels.pop();
        assert!(Frame::upload(&device, &memory, SizeClass::Raw, img).is_err());
    }

    #[test]
    fn test_pair_enforces_tolerance_and_distinct_cameras() {
        let (device, memory) = setup();
        let a = Frame::upload(&device, &memory, SizeClass::Raw, image(CameraId::LEFT, 1_000, 1)).unwrap();
        let b = Frame::upload(&device, &memory, SizeClass::Raw, image(CameraId::RIGHT, 3_000, 2)).unwrap();

        let err = FramePair::new(5, a.clone(), b.clone(), 1_000).unwrap_err();
        assert!(matches!(err, StitchError::Sync { skew_ns: 2_000, .. }));

        assert!(FramePair::new(5, a.clone(), a.clone(), 10_000).is_err());

        // Skew must stay strictly below the tolerance.
        let err = FramePair::new(5, a.clone(), b.clone(), 2_000).unwrap_err();
        assert!(matches!(err, StitchError::Sync { skew_ns: 2_000, .. }));

        let pair = FramePair::new(5, a, b, 2_001).unwrap();
        assert_eq!(pair.timestamp_ns(), 1_000);
    }

    #[test]
    fn test_flags_deduplicate_degraded_reasons() {
        let mut flags = FrameFlags::default();
        flags.mark_degraded(DegradedReason::DriftFallback);
        flags.mark_degraded(DegradedReason::DriftFallback);
        assert_eq!(flags.degraded.len(), 1);
        assert!(flags.is_degraded());
        assert!(!flags.is_missing());
        assert!(FrameFlags::missing(MissingReason::SyncRejected).is_missing());
    }
}
