// # Pipeline Metrics
//
// Lock-free counters updated by every pipeline thread, and the report derived from them
// when a session ends.
//
// ## Tracked Indicators
//
// - **Admission**: pairs accepted into the pipeline and sync rejections
// - **Delivery**: panoramas handed to the encoder, missing markers, degraded frames
// - **Recovery**: transient failures that were retried
// - **Throughput**: delivered frames per wall-clock second
//
// Counters only ever increase; a report is a consistent enough snapshot for logging and
// assertions once the pipeline has drained.

use crate::core::stage_queue::QueueSnapshot;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters for one pipeline session.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    admitted: AtomicU64,
    skipped: AtomicU64,
    encoded: AtomicU64,
    missing: AtomicU64,
    degraded: AtomicU64,
    retries: AtomicU64,
    sync_rejections: AtomicU64,
    source_faults: AtomicU64,
    stage_faults: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames at or before a resume checkpoint that were never read.
    pub fn record_skipped(&self, frames: u64) {
        self.skipped.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_encoded(&self, degraded: bool) {
        self.encoded.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_missing(&self) {
        self.missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_rejection(&self) {
        self.sync_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_fault(&self) {
        self.source_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_fault(&self) {
        self.stage_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoded(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    pub fn missing(&self) -> u64 {
        self.missing.load(Ordering::Relaxed)
    }

    /// Freezes the counters into a report covering `elapsed` of wall-clock time.
    pub fn report(&self, elapsed: Duration, queues: Vec<QueueSnapshot>) -> MetricsReport {
        let encoded = self.encoded.load(Ordering::Relaxed);
        let missing = self.missing.load(Ordering::Relaxed);
        let seconds = elapsed.as_secs_f64();
        let delivered_fps = if seconds > 0.0 {
            (encoded + missing) as f64 / seconds
        } else {
            0.0
        };
        MetricsReport {
            admitted: self.admitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            encoded,
            missing,
            degraded: self.degraded.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            sync_rejections: self.sync_rejections.load(Ordering::Relaxed),
            source_faults: self.source_faults.load(Ordering::Relaxed),
            stage_faults: self.stage_faults.load(Ordering::Relaxed),
            elapsed_ms: elapsed.as_millis() as u64,
            delivered_fps,
            queues,
        }
    }
}

/// Final counters of a pipeline session.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsReport {
    pub admitted: u64,
    pub skipped: u64,
    pub encoded: u64,
    pub missing: u64,
    pub degraded: u64,
    pub retries: u64,
    pub sync_rejections: u64,
    pub source_faults: u64,
    pub stage_faults: u64,
    pub elapsed_ms: u64,
    /// Encoded plus missing frames per second of wall-clock time
    pub delivered_fps: f64,
    pub queues: Vec<QueueSnapshot>,
}

impl MetricsReport {
    /// Frames that reached the encoder, as a panorama or a missing marker.
    pub fn delivered(&self) -> u64 {
        self.encoded + self.missing
    }

    /// Human-readable summary for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Pipeline Summary");
        let _ = writeln!(out, "────────────────");
        let _ = writeln!(out, "Delivered: {} ({} encoded, {} missing)", self.delivered(), self.encoded, self.missing);
        let _ = writeln!(out, "Degraded:  {}", self.degraded);
        let _ = writeln!(out, "Skipped:   {} (resume)", self.skipped);
        let _ = writeln!(
            out,
            "Faults:    {} sync, {} source, {} stage, {} retries",
            self.sync_rejections, self.source_faults, self.stage_faults, self.retries
        );
        let _ = writeln!(out, "Rate:      {:.1} fps over {:.2}s", self.delivered_fps, self.elapsed_ms as f64 / 1000.0);
        for queue in &self.queues {
            let _ = writeln!(
                out,
                "Queue {:<10} high water {}/{}",
                queue.name, queue.high_water, queue.capacity
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_and_rate() {
        let metrics = PipelineMetrics::new();
        for _ in 0..8 {
            metrics.record_admitted();
            metrics.record_encoded(false);
        }
        metrics.record_encoded(true);
        metrics.record_missing();
        metrics.record_retry();

        let report = metrics.report(Duration::from_secs(2), Vec::new());
        assert_eq!(report.encoded, 9);
        assert_eq!(report.degraded, 1);
        assert_eq!(report.delivered(), 10);
        assert!((report.delivered_fps - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_lists_queues() {
        let report = MetricsReport {
            queues: vec![QueueSnapshot {
                name: "rectified",
                capacity: 3,
                high_water: 2,
                pushed: 10,
            }],
            ..MetricsReport::default()
        };
        let text = report.render();
        assert!(text.contains("Pipeline Summary"));
        assert!(text.contains("rectified"));
        assert!(text.contains("2/3"));
    }
}
