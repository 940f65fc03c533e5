//! End-to-end tests: synthetic clips through the whole pipeline into an in-memory sink.

mod common;

use common::{MemorySink, fast_config, mean_abs_diff, mean_ratio, session};
use panorama_stitch::capture::{FaultPlan, SyntheticRig};
use panorama_stitch::config::PipelineConfig;
use panorama_stitch::core::frame::{CameraId, MissingReason};
use panorama_stitch::quality_tap;

#[test]
fn test_ten_second_clip_with_exposure_offset() {
    let rig = SyntheticRig::new(64, 32)
        .fps(40.0)
        .frames(400)
        .overlap_fraction(0.2)
        .right_gain(1.3)
        .faults(
            FaultPlan::default()
                .skew(100, 40_000_000)
                .glitch(CameraId::RIGHT, 200, 2),
        );
    let sink = MemorySink::new();
    let report = session(&rig, fast_config(), sink.clone())
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Every input frame reaches the encoder exactly once, in order.
    assert_eq!(sink.indices(), (0..400).collect::<Vec<_>>());
    assert_eq!(report.metrics.encoded, 399);
    assert_eq!(report.metrics.missing, 1);
    assert_eq!(report.metrics.sync_rejections, 1);
    assert!(report.metrics.retries >= 2);

    let pano = rig.panorama();
    let (w, h) = (pano.width as usize, pano.height as usize);
    let seam_start = (rig.resolution().width - rig.overlap_px()) as usize;
    let frames = sink.frames();
    for frame in &frames {
        assert_eq!(frame.job_id, "job-test");
        if frame.index == 100 {
            assert_eq!(frame.missing, Some(MissingReason::SyncRejected));
            assert!(frame.pixels.is_none());
            continue;
        }
        assert_eq!(frame.timestamp_ns, rig.timestamp_ns(frame.index));
        let pixels = frame.pixels.as_ref().unwrap();
        let ideal = rig.ideal_panorama(frame.index);
        let err = mean_abs_diff(pixels, &ideal, w, h, 2);
        assert!(err < 3.0, "frame {} differs from the ideal panorama by {err}", frame.index);

        // cam1 is 30% brighter; after matching the seam and right side follow cam0.
        let ratio = mean_ratio(&ideal, pixels, w, h, seam_start, w - 2);
        assert!((ratio - 1.0).abs() < 0.03, "frame {} right side ratio {ratio}", frame.index);
    }
    assert!(report.pools.iter().all(|(_, stats)| stats.in_use == 0));
}

#[test]
fn test_dark_first_frame_does_not_delay_color_correction() {
    // cam1 delivers a black frame first, then runs 30% bright.
    let rig = SyntheticRig::new(64, 32).frames(4).right_gain(0.0).exposure_step(1, 1.3);
    let sink = MemorySink::new();
    session(&rig, fast_config(), sink.clone()).build().unwrap().run().unwrap();

    let pano = rig.panorama();
    let (w, h) = (pano.width as usize, pano.height as usize);
    let seam_start = (rig.resolution().width - rig.overlap_px()) as usize;
    for frame in &sink.frames()[1..] {
        let ratio = mean_ratio(&rig.ideal_panorama(frame.index), frame.pixels.as_ref().unwrap(), w, h, seam_start, w - 2);
        assert!((ratio - 1.0).abs() < 0.04, "frame {} right side ratio {ratio}", frame.index);
    }
}

#[test]
fn test_glitch_past_retry_budget_becomes_source_fault_marker() {
    let config = fast_config();
    let rig = SyntheticRig::new(32, 16)
        .frames(12)
        .faults(FaultPlan::default().glitch(CameraId::LEFT, 5, config.frame_retry_limit + 1));
    let sink = MemorySink::new();
    let report = session(&rig, config, sink.clone()).build().unwrap().run().unwrap();

    let frames = sink.frames();
    assert_eq!(frames.len(), 12);
    assert_eq!(frames[5].missing, Some(MissingReason::SourceFault));
    assert!(frames.iter().filter(|f| f.index != 5).all(|f| f.pixels.is_some()));
    assert_eq!(report.metrics.source_faults, 1);
    assert_eq!(report.last_completed, Some(11));
}

#[test]
fn test_quality_tap_reports_every_frame() {
    let rig = SyntheticRig::new(32, 16)
        .frames(10)
        .right_gain(1.2)
        .faults(FaultPlan::default().skew(4, 30_000_000));
    let config = fast_config();
    let (tap, feed) = quality_tap(config.quality_tap_depth);
    session(&rig, config, MemorySink::new())
        .quality_tap(tap)
        .build()
        .unwrap()
        .run()
        .unwrap();

    let events = feed.drain();
    assert_eq!(events.iter().map(|e| e.index).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    assert_eq!(events[4].flags.missing, Some(MissingReason::SyncRejected));
    let color = events[9].color.expect("color estimate after ten frames");
    for gain in color.gain {
        assert!((gain - 1.0 / 1.2).abs() < 0.03, "gain {gain}");
    }
    assert_eq!(feed.overflowed(), 0);
}

#[test]
fn test_pipeline_runs_with_multiband_blend() {
    let rig = SyntheticRig::new(64, 32).frames(6).right_gain(1.1);
    let config = PipelineConfig {
        blend: pano_warp::blend::BlendMode::MultiBand { levels: 3 },
        ..fast_config()
    };
    let sink = MemorySink::new();
    session(&rig, config, sink.clone()).build().unwrap().run().unwrap();

    let pano = rig.panorama();
    for frame in sink.frames() {
        let err = mean_abs_diff(
            frame.pixels.as_ref().unwrap(),
            &rig.ideal_panorama(frame.index),
            pano.width as usize,
            pano.height as usize,
            2,
        );
        assert!(err < 4.0, "frame {} error {err}", frame.index);
    }
}
