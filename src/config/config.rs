//! # Pipeline Configuration
//!
//! Static tuning consumed once at job start and shared read-only by every stage. The
//! values come from a JSON file produced by an external optimizer or written by hand;
//! any field left out takes its default.
//!
//! ## Parameters
//!
//! | Parameter | Default | Description |
//! |-----------|---------|-------------|
//! | `queue_depth` | 3 | Capacity of each inter-stage queue |
//! | `buffers_per_class` | derived | Override for every pool's buffer count, at least `2 * (queue_depth + 1)` |
//! | `pool_hard_cap` | 64 | Buffers a single pool may ever hold |
//! | `acquire_timeout_ms` | 2000 | Wait for a free device buffer before retrying |
//! | `handoff_timeout_ms` | 5000 | Wait for encoder queue space before retrying |
//! | `frame_retry_limit` | 3 | Retries of a transient per-frame failure |
//! | `max_consecutive_drops` | 25 | Missing frames in a row before the job fails |
//! | `max_consecutive_desync` | 10 | Skewed pairs in a row before the job fails |
//! | `target_fps` | 50 | Admission rate |
//! | `pace_admission` | true | Whether admission sleeps to hold `target_fps` |
//! | `sync_tolerance_us` | 8000 | Capture skew within a pair must stay below this |
//! | `color.alpha` | 0.1 | Smoothing weight of a new color measurement |
//! | `color.min_variance` | 4.0 | Overlap variance below which a measurement is unusable |
//! | `alignment.alpha` | 0.3 | Smoothing weight of a new alignment measurement |
//! | `alignment.search_radius_px` | 6 | Integer search window around the prior, wider than the drift threshold |
//! | `alignment.drift_threshold_px` | 3.0 | Jump that resets the prior to calibration |
//! | `alignment.min_contrast` | 1.0 | Cost contrast below which the seam is too flat to measure |
//! | `alignment.sample_step` | 2 | Seam sampling stride |
//! | `blend` | linear | `{"method":"linear"}` or `{"method":"multi_band","levels":4}` |
//! | `border` | black | `black` or `clamp` for samples outside a camera image |
//! | `checkpoint_interval` | 250 | Frames between durable checkpoints |
//! | `encoder_queue_depth` | 4 | Panoramas waiting for the encoder |
//! | `quality_tap_depth` | 64 | Quality events buffered before overflow |

use crate::core::buffer_pool::SizeClass;
use crate::error::{StitchError, StitchResult};
use pano_warp::blend::BlendMode;
use pano_warp::remap::BorderPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Exposure matching between the two cameras.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorConfig {
    pub alpha: f64,
    pub min_variance: f64,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            min_variance: 4.0,
        }
    }
}

/// Frame-to-frame seam alignment tracking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignmentConfig {
    pub alpha: f64,
    pub search_radius_px: u32,
    pub drift_threshold_px: f64,
    pub min_contrast: f64,
    pub sample_step: u32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            search_radius_px: 6,
            drift_threshold_px: 3.0,
            min_contrast: 1.0,
            sample_step: 2,
        }
    }
}

/// Tuning of one pipeline instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffers_per_class: Option<usize>,
    pub pool_hard_cap: usize,
    pub acquire_timeout_ms: u64,
    pub handoff_timeout_ms: u64,
    pub frame_retry_limit: u32,
    pub max_consecutive_drops: u32,
    pub max_consecutive_desync: u32,
    pub target_fps: f64,
    pub pace_admission: bool,
    pub sync_tolerance_us: u64,
    pub color: ColorConfig,
    pub alignment: AlignmentConfig,
    pub blend: BlendMode,
    pub border: BorderPolicy,
    pub checkpoint_interval: u64,
    pub encoder_queue_depth: usize,
    pub quality_tap_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 3,
            buffers_per_class: None,
            pool_hard_cap: 64,
            acquire_timeout_ms: 2000,
            handoff_timeout_ms: 5000,
            frame_retry_limit: 3,
            max_consecutive_drops: 25,
            max_consecutive_desync: 10,
            target_fps: 50.0,
            pace_admission: true,
            sync_tolerance_us: 8000,
            color: ColorConfig::default(),
            alignment: AlignmentConfig::default(),
            blend: BlendMode::default(),
            border: BorderPolicy::default(),
            checkpoint_interval: 250,
            encoder_queue_depth: 4,
            quality_tap_depth: 64,
        }
    }
}

fn unit_interval(field: &str, value: f64) -> StitchResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(StitchError::config(field, value.to_string(), "must lie in (0, 1]"))
    }
}

impl PipelineConfig {
    /// Loads a configuration file; absent fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> StitchResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StitchError::io_at("read config", path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| StitchError::config("file", path.display().to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> StitchResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every parameter's range.
    pub fn validate(&self) -> StitchResult<()> {
        if !(1..=64).contains(&self.queue_depth) {
            return Err(StitchError::config("queue_depth", self.queue_depth.to_string(), "must be between 1 and 64"));
        }
        if let Some(count) = self.buffers_per_class {
            // Every queue slot plus the frame in flight, twice over for the raw pair.
            let floor = 2 * (self.queue_depth + 1);
            if count < floor {
                return Err(StitchError::config(
                    "buffers_per_class",
                    count.to_string(),
                    format!("must be at least {floor} for queue_depth {}", self.queue_depth),
                ));
            }
        }
        if self.pool_hard_cap == 0 {
            return Err(StitchError::config("pool_hard_cap", "0", "must be positive"));
        }
        if self.acquire_timeout_ms == 0 || self.handoff_timeout_ms == 0 {
            return Err(StitchError::config("timeouts", "0", "acquire and handoff timeouts must be positive"));
        }
        if !(self.target_fps.is_finite() && self.target_fps > 0.0) {
            return Err(StitchError::config("target_fps", self.target_fps.to_string(), "must be positive"));
        }
        if self.sync_tolerance_us == 0 {
            return Err(StitchError::config("sync_tolerance_us", "0", "no pair could ever be accepted"));
        }
        if self.max_consecutive_drops == 0 || self.max_consecutive_desync == 0 {
            return Err(StitchError::config("escalation thresholds", "0", "must be positive"));
        }
        unit_interval("color.alpha", self.color.alpha)?;
        unit_interval("alignment.alpha", self.alignment.alpha)?;
        if !(self.color.min_variance >= 0.0) {
            return Err(StitchError::config("color.min_variance", self.color.min_variance.to_string(), "must be non-negative"));
        }
        if self.alignment.search_radius_px > 64 {
            return Err(StitchError::config(
                "alignment.search_radius_px",
                self.alignment.search_radius_px.to_string(),
                "must not exceed 64",
            ));
        }
        if !(self.alignment.drift_threshold_px > 0.0) {
            return Err(StitchError::config(
                "alignment.drift_threshold_px",
                self.alignment.drift_threshold_px.to_string(),
                "must be positive",
            ));
        }
        // Offsets are only measured within the search window around the prior.
        if f64::from(self.alignment.search_radius_px) <= self.alignment.drift_threshold_px {
            return Err(StitchError::config(
                "alignment.search_radius_px",
                self.alignment.search_radius_px.to_string(),
                format!(
                    "must exceed drift_threshold_px ({}) or drift is never detected",
                    self.alignment.drift_threshold_px
                ),
            ));
        }
        if !(self.alignment.min_contrast >= 0.0) || self.alignment.sample_step == 0 {
            return Err(StitchError::config(
                "alignment",
                format!("{:?}", self.alignment),
                "min_contrast must be non-negative and sample_step positive",
            ));
        }
        if let BlendMode::MultiBand { levels } = self.blend {
            if !(1..=8).contains(&levels) {
                return Err(StitchError::config("blend.levels", levels.to_string(), "must be between 1 and 8"));
            }
        }
        if self.checkpoint_interval == 0 {
            return Err(StitchError::config("checkpoint_interval", "0", "must be positive"));
        }
        if self.encoder_queue_depth == 0 || self.quality_tap_depth == 0 {
            return Err(StitchError::config("queue depths", "0", "encoder and quality queues need capacity"));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn sync_tolerance_ns(&self) -> u64 {
        self.sync_tolerance_us.saturating_mul(1_000)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }

    /// Buffer count of each size class.
    ///
    /// Every pool covers its queue plus the frames held by the producing and consuming
    /// stages; rectified frames of cam0 stay alive until stitching.
    pub fn pool_plan(&self) -> Vec<(SizeClass, usize)> {
        let depth = self.queue_depth;
        let derived = [
            (SizeClass::Raw, 2 * (depth + 2)),
            (SizeClass::Rectified, 3 * depth + 6),
            (SizeClass::Matched, depth + 3),
            (SizeClass::Panorama, depth + self.encoder_queue_depth + 3),
        ];
        derived
            .into_iter()
            .map(|(class, count)| (class, self.buffers_per_class.unwrap_or(count)))
            .collect()
    }
}
