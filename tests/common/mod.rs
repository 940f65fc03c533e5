//! Common test utilities and helpers for the panorama_stitch integration tests
//!
//! Synthetic rigs, an in-memory encoder sink and image comparison helpers.

#![allow(dead_code)]

use panorama_stitch::capture::SyntheticRig;
use panorama_stitch::config::PipelineConfig;
use panorama_stitch::core::device::{DeviceContext, DeviceId};
use panorama_stitch::core::frame::{FrameFlags, FrameIndex, MissingReason};
use panorama_stitch::error::StitchResult;
use panorama_stitch::processing::{EncoderSink, FrameTag, Picture};
use panorama_stitch::session::{PipelineSession, PipelineSessionBuilder};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One frame as the encoder saw it.
#[derive(Clone, Debug, PartialEq)]
pub struct Recorded {
    pub index: FrameIndex,
    pub timestamp_ns: u64,
    pub job_id: String,
    pub flags: FrameFlags,
    /// `None` for missing markers
    pub pixels: Option<Vec<u8>>,
    pub missing: Option<MissingReason>,
}

/// Encoder sink that keeps every frame in memory.
///
/// Clones share the recording, so a test keeps one clone while the session owns
/// the other.
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Recorded>>>,
    syncs: Arc<Mutex<u32>>,
    delay: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that takes `delay` to encode each frame.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Recorded> {
        self.frames.lock().unwrap().clone()
    }

    pub fn indices(&self) -> Vec<FrameIndex> {
        self.frames().iter().map(|f| f.index).collect()
    }

    pub fn syncs(&self) -> u32 {
        *self.syncs.lock().unwrap()
    }
}

impl EncoderSink for MemorySink {
    fn encode(&mut self, picture: &Picture<'_>) -> StitchResult<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.frames.lock().unwrap().push(Recorded {
            index: picture.tag.index,
            timestamp_ns: picture.tag.timestamp_ns,
            job_id: picture.tag.job_id.clone(),
            flags: picture.flags.clone(),
            pixels: Some(picture.pixels.to_vec()),
            missing: None,
        });
        Ok(())
    }

    fn mark_missing(&mut self, tag: &FrameTag, reason: MissingReason) -> StitchResult<()> {
        self.frames.lock().unwrap().push(Recorded {
            index: tag.index,
            timestamp_ns: tag.timestamp_ns,
            job_id: tag.job_id.clone(),
            flags: FrameFlags::missing(reason),
            pixels: None,
            missing: Some(reason),
        });
        Ok(())
    }

    fn sync(&mut self) -> StitchResult<()> {
        *self.syncs.lock().unwrap() += 1;
        Ok(())
    }

    fn finish(&mut self) -> StitchResult<()> {
        Ok(())
    }
}

/// Unpaced configuration with frequent checkpoints.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        pace_admission: false,
        checkpoint_interval: 4,
        ..PipelineConfig::default()
    }
}

/// A session over `rig` on device 0, writing into `sink`.
pub fn session(rig: &SyntheticRig, config: PipelineConfig, sink: MemorySink) -> PipelineSessionBuilder {
    let (left, right) = rig.sources();
    PipelineSession::builder("job-test")
        .job_name("test")
        .device(DeviceContext::new(DeviceId(0)).unwrap())
        .calibration(rig.calibration().unwrap())
        .config(config)
        .sources(left, right)
        .sink(sink)
}

/// Mean absolute RGB difference, ignoring a `margin`-pixel border.
pub fn mean_abs_diff(a: &[u8], b: &[u8], width: usize, height: usize, margin: usize) -> f64 {
    assert_eq!(a.len(), b.len());
    let mut total = 0f64;
    let mut n = 0usize;
    for y in margin..height - margin {
        for x in margin..width - margin {
            for c in 0..3 {
                let i = (y * width + x) * 3 + c;
                total += (a[i] as f64 - b[i] as f64).abs();
                n += 1;
            }
        }
    }
    total / n as f64
}

/// Mean per-channel ratio of `b` to `a` over the columns `x0..x1`.
pub fn mean_ratio(a: &[u8], b: &[u8], width: usize, height: usize, x0: usize, x1: usize) -> f64 {
    let (mut sa, mut sb) = (0f64, 0f64);
    for y in 0..height {
        for x in x0..x1 {
            for c in 0..3 {
                let i = (y * width + x) * 3 + c;
                sa += a[i] as f64;
                sb += b[i] as f64;
            }
        }
    }
    sb / sa
}
