//! Memory manager behavior under pipeline load and direct contention.

mod common;

use common::{MemorySink, fast_config, session};
use panorama_stitch::capture::{FaultPlan, SyntheticRig};
use panorama_stitch::config::PipelineConfig;
use panorama_stitch::core::buffer_pool::{MemoryManager, SizeClass};
use panorama_stitch::core::frame::{CameraId, MissingReason};
use panorama_stitch::error::classify;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[test]
fn test_slow_encoder_backpressure_stays_within_pool_targets() {
    let rig = SyntheticRig::new(32, 16).frames(30);
    let config = PipelineConfig {
        queue_depth: 2,
        encoder_queue_depth: 2,
        ..fast_config()
    };
    let sink = MemorySink::slow(Duration::from_millis(5));
    let report = session(&rig, config, sink.clone()).build().unwrap().run().unwrap();

    assert_eq!(sink.indices(), (0..30).collect::<Vec<_>>());
    assert_eq!(report.metrics.missing, 0);
    for (class, stats) in &report.pools {
        assert!(stats.peak_in_use <= stats.target, "{class}: {stats:?}");
        assert!(stats.live <= stats.target, "{class}: {stats:?}");
        assert_eq!(stats.in_use, 0, "{class} leaked buffers");
        assert_eq!(stats.timeouts, 0, "{class} starved");
    }
    for queue in &report.metrics.queues {
        assert!(queue.high_water <= queue.capacity, "{queue:?}");
    }
}

#[test]
fn test_pool_above_hard_cap_fails_job() {
    let rig = SyntheticRig::new(32, 16).frames(4);
    let config = PipelineConfig {
        buffers_per_class: Some(10),
        pool_hard_cap: 8,
        ..fast_config()
    };
    let err = session(&rig, config, MemorySink::new()).build().unwrap().run().unwrap_err();
    assert_eq!(err.category(), "resource");
    assert!(classify::is_fatal(&err));
}

#[test]
fn test_undersized_pool_is_rejected_before_any_output() {
    // One raw buffer cannot hold a pair, so every frame would starve.
    let rig = SyntheticRig::new(32, 16).frames(6);
    let config = PipelineConfig {
        buffers_per_class: Some(1),
        ..fast_config()
    };
    let sink = MemorySink::new();
    let err = session(&rig, config, sink.clone()).build().err().unwrap();
    assert_eq!(err.category(), "config");
    assert!(sink.frames().is_empty());
}

#[test]
fn test_sustained_frame_loss_fails_job() {
    let mut faults = FaultPlan::default();
    for index in 2..10 {
        faults = faults.glitch(CameraId::RIGHT, index, 5);
    }
    let rig = SyntheticRig::new(32, 16).frames(12).faults(faults);
    let config = PipelineConfig {
        frame_retry_limit: 0,
        max_consecutive_drops: 3,
        ..fast_config()
    };
    let sink = MemorySink::new();
    let err = session(&rig, config, sink.clone()).build().unwrap().run().unwrap_err();
    assert_eq!(err.category(), "resource");
    assert!(classify::is_fatal(&err));

    let frames = sink.frames();
    assert!(frames[..2].iter().all(|f| f.pixels.is_some()));
    assert!(frames[2..].iter().all(|f| f.missing == Some(MissingReason::SourceFault)));
    assert!(frames.len() <= 6, "kept encoding after the drop limit: {}", frames.len());
}

#[test]
fn test_blocked_acquire_waits_for_release_and_never_shares_a_buffer() {
    let mm = MemoryManager::new(4, Duration::from_secs(5));
    mm.configure_class(SizeClass::Matched, 16, 2).unwrap();

    let a = mm.acquire(SizeClass::Matched).unwrap();
    let b = mm.acquire(SizeClass::Matched).unwrap();
    a.memory().write().unwrap().fill(0xAA);
    b.memory().write().unwrap().fill(0xBB);

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let mm = Arc::clone(&mm);
        let acquired = Arc::clone(&acquired);
        std::thread::spawn(move || {
            let c = mm.acquire(SizeClass::Matched).unwrap();
            acquired.store(true, Ordering::SeqCst);
            c.memory().write().unwrap().fill(0xCC);
            c.handle()
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst), "acquire beyond capacity must block");
    let a_handle = a.handle();
    drop(a);

    let c_handle = waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(c_handle.slot(), a_handle.slot());
    assert_ne!(c_handle.generation(), a_handle.generation());
    // The buffer still in use was never touched.
    assert!(b.read().unwrap().iter().all(|&v| v == 0xBB));
    assert!(mm.memory(a_handle).is_err());

    let stats = mm.stats(SizeClass::Matched).unwrap();
    assert_eq!(stats.peak_in_use, 2);
    assert_eq!(stats.live, 2);
    assert!(stats.waits >= 1);
}
