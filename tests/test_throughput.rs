//! Sustained frame rate with paced admission, and queue growth under load.

mod common;

use common::{MemorySink, fast_config, session};
use panorama_stitch::capture::SyntheticRig;
use panorama_stitch::config::{AlignmentConfig, PipelineConfig};

fn light_alignment() -> AlignmentConfig {
    AlignmentConfig {
        search_radius_px: 4,
        ..AlignmentConfig::default()
    }
}

#[test]
fn test_paced_pipeline_sustains_forty_fps() {
    let rig = SyntheticRig::new(64, 32).fps(40.0).frames(120);
    let config = PipelineConfig {
        pace_admission: true,
        target_fps: 40.0,
        alignment: light_alignment(),
        ..fast_config()
    };
    let sink = MemorySink::new();
    let report = session(&rig, config, sink.clone()).build().unwrap().run().unwrap();

    assert_eq!(report.metrics.delivered(), 120);
    assert_eq!(report.metrics.missing, 0);
    let fps = report.metrics.delivered_fps;
    assert!(fps >= 36.0, "delivered {fps:.1} fps");
    // Pacing caps admission at the target.
    assert!(fps <= 44.0, "delivered {fps:.1} fps");
    for queue in &report.metrics.queues {
        assert!(queue.high_water <= queue.capacity, "{queue:?}");
    }
}

#[test]
fn test_unpaced_pipeline_outruns_target() {
    let rig = SyntheticRig::new(64, 32).frames(200);
    let config = PipelineConfig {
        alignment: light_alignment(),
        ..fast_config()
    };
    let report = session(&rig, config, MemorySink::new()).build().unwrap().run().unwrap();

    assert_eq!(report.metrics.encoded, 200);
    assert!(report.metrics.delivered_fps > 40.0, "{:.1} fps", report.metrics.delivered_fps);
    let summary = report.metrics.render();
    assert!(summary.contains("Pipeline Summary"));
}
