//! Crash and resume: a resumed job reproduces the uninterrupted output exactly.

mod common;

use common::{MemorySink, fast_config, session};
use panorama_stitch::PipelineSession;
use panorama_stitch::capture::{DriftSchedule, SyntheticRig};
use panorama_stitch::core::device::{DeviceContext, DeviceId};
use panorama_stitch::core::frame::{FrameIndex, MissingReason};
use panorama_stitch::error::{StitchError, StitchResult};
use panorama_stitch::jobs::CheckpointStore;
use panorama_stitch::processing::{EncoderSink, FrameTag, Picture, RawFileSink};
use std::path::Path;

/// Forwards to `inner` until frame `crash_at`, where the encoder dies.
struct CrashingSink<S> {
    inner: S,
    crash_at: FrameIndex,
}

impl<S: EncoderSink> EncoderSink for CrashingSink<S> {
    fn encode(&mut self, picture: &Picture<'_>) -> StitchResult<()> {
        if picture.tag.index == self.crash_at {
            return Err(StitchError::encoder("encoder process died"));
        }
        self.inner.encode(picture)
    }

    fn mark_missing(&mut self, tag: &FrameTag, reason: MissingReason) -> StitchResult<()> {
        self.inner.mark_missing(tag, reason)
    }

    fn sync(&mut self) -> StitchResult<()> {
        self.inner.sync()
    }

    fn finish(&mut self) -> StitchResult<()> {
        self.inner.finish()
    }
}

/// A rig whose smoothed state keeps changing: an exposure step and a seam drift.
fn rig() -> SyntheticRig {
    SyntheticRig::new(64, 32)
        .frames(24)
        .right_gain(1.3)
        .exposure_step(6, 1.1)
        .drift(DriftSchedule::default().step(5, 1.5, 0.5))
}

fn crash(rig: &SyntheticRig, out: &Path, store: &CheckpointStore, crash_at: FrameIndex) {
    let (left, right) = rig.sources();
    let err = PipelineSession::builder("job-1")
        .job_name("game")
        .device(DeviceContext::new(DeviceId(0)).unwrap())
        .calibration(rig.calibration().unwrap())
        .config(fast_config())
        .sources(left, right)
        .sink(CrashingSink {
            inner: RawFileSink::create(out).unwrap(),
            crash_at,
        })
        .checkpoints(store.clone())
        .build()
        .unwrap()
        .run()
        .unwrap_err();
    assert_eq!(err.category(), "encoder");
}

#[test]
fn test_resumed_output_is_bit_identical() {
    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints"));

    let reference = MemorySink::new();
    session(&rig, fast_config(), reference.clone()).build().unwrap().run().unwrap();

    // Frames 8 and 9 reach the encoder but are not covered by the checkpoint at 7.
    crash(&rig, &dir.path().join("out"), &store, 10);
    let checkpoint = store.load("game").unwrap().unwrap();
    assert_eq!(checkpoint.last_frame, 7);
    assert!(checkpoint.state.color.is_some());
    assert!(checkpoint.state.alignment.is_some());

    let resumed = MemorySink::new();
    let report = session(&rig, fast_config(), resumed.clone())
        .resume_from(checkpoint)
        .build()
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.first_frame, 8);

    // Nothing at or before the checkpoint is emitted again.
    assert_eq!(resumed.indices(), (8..24).collect::<Vec<_>>());
    let expected = reference.frames();
    for frame in resumed.frames() {
        let original = &expected[frame.index as usize];
        assert_eq!(frame.flags, original.flags, "frame {} flags", frame.index);
        assert!(frame.pixels == original.pixels, "frame {} pixels differ", frame.index);
    }
}

#[test]
fn test_resumed_file_output_matches_uninterrupted_file() {
    let rig = rig();
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let out = dir.path().join("out");
    let reference_out = dir.path().join("reference");

    let (left, right) = rig.sources();
    PipelineSession::builder("job-0")
        .job_name("reference")
        .device(DeviceContext::new(DeviceId(0)).unwrap())
        .calibration(rig.calibration().unwrap())
        .config(fast_config())
        .sources(left, right)
        .sink(RawFileSink::create(&reference_out).unwrap())
        .build()
        .unwrap()
        .run()
        .unwrap();

    crash(&rig, &out, &store, 14);
    let checkpoint = store.load("game").unwrap().unwrap();
    assert_eq!(checkpoint.last_frame, 11);
    // The crashed run wrote two frames past its checkpoint.
    assert_eq!(RawFileSink::read_index(&out).unwrap().len(), 14);

    let (left, right) = rig.sources();
    PipelineSession::builder("job-2")
        .job_name("game")
        .device(DeviceContext::new(DeviceId(0)).unwrap())
        .calibration(rig.calibration().unwrap())
        .config(fast_config())
        .sources(left, right)
        .sink(RawFileSink::resume(&out, checkpoint.last_frame).unwrap())
        .checkpoints(store.clone())
        .resume_from(checkpoint)
        .build()
        .unwrap()
        .run()
        .unwrap();

    let index = RawFileSink::read_index(&out).unwrap();
    let reference_index = RawFileSink::read_index(&reference_out).unwrap();
    assert_eq!(index, reference_index);
    assert!(
        std::fs::read(out.join("frames.rgb")).unwrap() == std::fs::read(reference_out.join("frames.rgb")).unwrap(),
        "resumed frames differ from the uninterrupted run"
    );
    assert_eq!(store.load("game").unwrap().unwrap().last_frame, 23);
}
