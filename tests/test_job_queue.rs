//! Job queue over the file-system environment: image sequences on disk, calibration
//! profiles by id, raw output files and checkpoints.

mod common;

use common::fast_config;
use panorama_stitch::capture::{SyntheticLayout, SyntheticRig};
use panorama_stitch::config::{JobDescriptor, PipelineConfig, SourceRef};
use panorama_stitch::core::device::{DeviceContext, DeviceId};
use panorama_stitch::jobs::{CheckpointStore, FileSystemEnvironment, JobId, JobQueue, JobState, JobStatus};
use panorama_stitch::processing::RawFileSink;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const FPS: f64 = 40.0;

fn job(name: &str, layout: &SyntheticLayout, out: &Path) -> JobDescriptor {
    JobDescriptor {
        name: name.to_string(),
        left_source: SourceRef {
            path: layout.left.clone(),
            fps: Some(FPS),
        },
        right_source: SourceRef {
            path: layout.right.clone(),
            fps: Some(FPS),
        },
        calibration_profile: "stadium".to_string(),
        output: out.join(name),
        resume: false,
    }
}

fn start(layout: &SyntheticLayout, root: &Path, config: PipelineConfig, devices: u32) -> JobQueue {
    let env = Arc::new(FileSystemEnvironment::new(&layout.calibration_dir, root.join("checkpoints"), FPS));
    let devices = (0..devices).map(|i| DeviceContext::new(DeviceId(i)).unwrap()).collect();
    JobQueue::start(env, config, devices).unwrap()
}

async fn wait(queue: &JobQueue, id: JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(120), queue.wait(id))
        .await
        .expect("job did not finish")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_share_devices_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SyntheticRig::new(32, 16).fps(FPS).frames(12).profile_id("stadium");
    let layout = rig.write_to(dir.path().join("rig")).unwrap();
    let queue = start(&layout, dir.path(), fast_config(), 2);

    let ids: Vec<JobId> = ["a", "b", "c"]
        .iter()
        .map(|name| queue.submit(job(name, &layout, dir.path())).unwrap())
        .collect();

    loop {
        let jobs = queue.jobs().unwrap();
        let running: Vec<_> = jobs.iter().filter(|s| s.state == JobState::Running).collect();
        assert!(running.len() <= 2);
        let devices: HashSet<_> = running.iter().map(|s| s.device).collect();
        assert_eq!(devices.len(), running.len(), "two jobs on one device: {running:?}");
        if jobs.iter().all(|s| s.state.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    for (id, name) in ids.into_iter().zip(["a", "b", "c"]) {
        let status = wait(&queue, id).await;
        assert_eq!(status.state, JobState::Completed, "{name}: {:?}", status.failure);
        assert_eq!(status.last_checkpoint, Some(11));
        assert_eq!(RawFileSink::read_index(dir.path().join(name)).unwrap().len(), 12);
        assert_eq!(store.load(name).unwrap().unwrap().last_frame, 11);
    }
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_job_resumes_to_identical_output() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SyntheticRig::new(32, 16)
        .fps(FPS)
        .frames(60)
        .right_gain(1.25)
        .profile_id("stadium");
    let layout = rig.write_to(dir.path().join("rig")).unwrap();

    // Slow enough to cancel part way through.
    let paced = start(
        &layout,
        dir.path(),
        PipelineConfig {
            pace_admission: true,
            target_fps: 40.0,
            ..fast_config()
        },
        1,
    );
    let id = paced.submit(job("game", &layout, dir.path())).unwrap();
    let mut rx = paced.subscribe(id).unwrap();
    tokio::time::timeout(
        Duration::from_secs(60),
        rx.wait_for(|s| s.last_checkpoint.is_some_and(|last| last >= 7)),
    )
    .await
    .unwrap()
    .unwrap();
    paced.cancel(id).unwrap();
    let cancelled = wait(&paced, id).await;
    assert!(cancelled.is_cancelled());
    let last = cancelled.last_checkpoint.unwrap();
    assert!(last < 59, "job finished before it was cancelled");
    paced.shutdown().await;

    let queue = start(&layout, dir.path(), fast_config(), 1);
    let mut again = job("game", &layout, dir.path());
    again.resume = true;
    let resumed = wait(&queue, queue.submit(again).unwrap()).await;
    assert_eq!(resumed.state, JobState::Completed, "{:?}", resumed.failure);
    let report = resumed.report.unwrap();
    assert_eq!(report.first_frame, last + 1);
    assert_eq!(report.metrics.encoded, 59 - last);

    let reference = wait(&queue, queue.submit(job("reference", &layout, dir.path())).unwrap()).await;
    assert_eq!(reference.state, JobState::Completed);
    queue.shutdown().await;

    let resumed_index = RawFileSink::read_index(dir.path().join("game")).unwrap();
    let reference_index = RawFileSink::read_index(dir.path().join("reference")).unwrap();
    assert_eq!(resumed_index, reference_index);
    assert!(
        std::fs::read(dir.path().join("game/frames.rgb")).unwrap()
            == std::fs::read(dir.path().join("reference/frames.rgb")).unwrap()
    );
}

#[tokio::test]
async fn test_missing_sources_fail_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SyntheticRig::new(32, 16).frames(2).profile_id("stadium");
    let layout = rig.write_to(dir.path().join("rig")).unwrap();
    let queue = start(&layout, dir.path(), fast_config(), 1);

    let mut broken = job("broken", &layout, dir.path());
    broken.right_source.path = dir.path().join("nowhere");
    let status = wait(&queue, queue.submit(broken).unwrap()).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(status.failure.is_some());

    // The device is free again for the next job.
    let ok = wait(&queue, queue.submit(job("ok", &layout, dir.path())).unwrap()).await;
    assert_eq!(ok.state, JobState::Completed, "{:?}", ok.failure);
    queue.shutdown().await;
}
