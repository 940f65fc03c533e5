//! Seam alignment tracking against a rig whose second camera drifts by known amounts.

mod common;

use common::{MemorySink, fast_config, mean_abs_diff, session};
use panorama_stitch::capture::{DriftSchedule, SyntheticRig};
use panorama_stitch::core::frame::DegradedReason;
use panorama_stitch::{QualityEvent, quality_tap};

fn run_with_tap(rig: &SyntheticRig) -> (Vec<QualityEvent>, MemorySink) {
    let config = fast_config();
    let (tap, feed) = quality_tap(rig.frame_count() as usize);
    let sink = MemorySink::new();
    session(rig, config, sink.clone())
        .quality_tap(tap)
        .build()
        .unwrap()
        .run()
        .unwrap();
    (feed.drain(), sink)
}

#[test]
fn test_alignment_error_stays_bounded_under_small_drift() {
    let rig = SyntheticRig::new(64, 32).frames(40).drift(
        DriftSchedule::default()
            .step(10, 1.5, 0.0)
            .step(25, 2.5, 0.5),
    );
    let (events, sink) = run_with_tap(&rig);
    assert_eq!(events.len(), 40);

    for event in &events {
        assert!(!event.flags.is_degraded(), "frame {} degraded: {:?}", event.index, event.flags);
        let prior = event.alignment.expect("alignment tracked");
        let (dx, dy) = rig.drift_at(event.index);
        let err = (prior.dx - dx).hypot(prior.dy - dy);
        assert!(err < 1.6, "frame {} alignment error {err} px", event.index);
    }

    let last = events.last().unwrap().alignment.unwrap();
    assert!((last.dx - 2.5).abs() < 0.4 && (last.dy - 0.5).abs() < 0.4, "{last:?}");

    // Compensated output matches the undrifted scene once the prior has settled.
    let pano = rig.panorama();
    let frame = sink.frames().pop().unwrap();
    let err = mean_abs_diff(
        frame.pixels.as_ref().unwrap(),
        &rig.ideal_panorama(frame.index),
        pano.width as usize,
        pano.height as usize,
        4,
    );
    assert!(err < 3.0, "settled panorama error {err}");
}

#[test]
fn test_drift_jump_is_flagged_and_recovers() {
    let rig = SyntheticRig::new(64, 32)
        .frames(16)
        .drift(DriftSchedule::default().step(8, 5.0, 0.0));
    let (events, sink) = run_with_tap(&rig);

    assert!(events[..8].iter().all(|e| !e.flags.is_degraded()));
    assert!(events[8].flags.degraded.contains(&DegradedReason::DriftFallback));
    assert_eq!(events[8].alignment, None);
    assert!(events[9..].iter().all(|e| !e.flags.is_degraded()));

    let last = events.last().unwrap().alignment.unwrap();
    assert!((last.dx - 5.0).abs() < 0.5, "{last:?}");

    // The fallback frame is still encoded, carrying its flag.
    let frames = sink.frames();
    assert_eq!(frames.len(), 16);
    assert!(frames[8].pixels.is_some());
    assert!(frames[8].flags.degraded.contains(&DegradedReason::DriftFallback));
}
