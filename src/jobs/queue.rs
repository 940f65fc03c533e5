//! # Batch Job Queue
//!
//! Schedules whole-game jobs across devices. Each device gets one async worker that
//! claims queued jobs in submission order, so a device never runs two jobs at once.
//! The pipeline itself is blocking and runs under `spawn_blocking`.
//!
//! ## Lifecycle
//!
//! ```text
//! submit ──► Queued ──claim──► Running ──► Completed
//!              │                  │
//!              └──cancel──► Failed ◄──── fatal error / cancel
//! ```
//!
//! Every job publishes its [`JobStatus`] through a `watch` channel; [`JobQueue::wait`]
//! resolves once the status is terminal.

use crate::config::{JobDescriptor, PipelineConfig};
use crate::core::device::{DeviceContext, DeviceId};
use crate::error::{StitchError, StitchResult};
use crate::jobs::checkpoint::Checkpoint;
use crate::jobs::environment::JobEnvironment;
use crate::jobs::job::{CANCELLED, JobId, JobState, JobStatus};
use crate::quality::QualityTap;
use crate::session::{CheckpointHook, PipelineSession, SessionReport};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

struct JobEntry {
    descriptor: JobDescriptor,
    status: watch::Sender<JobStatus>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    pending: VecDeque<JobId>,
    entries: HashMap<JobId, JobEntry>,
}

/// A job taken off the pending list by a device worker.
struct Claim {
    id: JobId,
    descriptor: JobDescriptor,
    cancel: CancellationToken,
}

struct Shared {
    env: Arc<dyn JobEnvironment>,
    config: PipelineConfig,
    quality: Option<QualityTap>,
    table: Mutex<JobTable>,
    work: Notify,
    shutdown: CancellationToken,
}

fn unknown_job(id: JobId) -> StitchError {
    StitchError::validation("job_id", "a job known to this queue", id.to_string())
}

impl Shared {
    fn lock(&self) -> StitchResult<MutexGuard<'_, JobTable>> {
        self.table.lock().map_err(|_| StitchError::poisoned("job table"))
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobStatus)) {
        match self.lock() {
            Ok(table) => {
                if let Some(entry) = table.entries.get(&id) {
                    entry.status.send_modify(f);
                }
            }
            Err(e) => warn!(job_id = %id, error = %e, "status update lost"),
        }
    }

    fn claim_next(&self, device: DeviceId) -> StitchResult<Option<Claim>> {
        let mut table = self.lock()?;
        while let Some(id) = table.pending.pop_front() {
            if let Some(entry) = table.entries.get(&id) {
                entry.status.send_modify(|s| {
                    s.state = JobState::Running;
                    s.device = Some(device);
                });
                return Ok(Some(Claim {
                    id,
                    descriptor: entry.descriptor.clone(),
                    cancel: entry.cancel.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Resolves the job's resources and runs its session to the end. Blocking.
    fn execute(
        self: &Arc<Self>,
        id: JobId,
        descriptor: &JobDescriptor,
        device: Arc<DeviceContext>,
        cancel: CancellationToken,
    ) -> StitchResult<SessionReport> {
        let calibration = self.env.load_calibration(&descriptor.calibration_profile)?;
        let checkpoints = self.env.checkpoints();
        let resume = if descriptor.resume {
            checkpoints.load(&descriptor.name)?
        } else {
            checkpoints.remove(&descriptor.name)?;
            None
        };

        // Checked before the sink is opened: resuming truncates output.
        if let Some(checkpoint) = &resume {
            if checkpoint.profile_id != calibration.profile_id() {
                return Err(StitchError::calibration(
                    calibration.profile_id(),
                    format!("checkpoint was recorded with profile '{}'", checkpoint.profile_id),
                )
                .escalate("calibration mismatch"));
            }
            info!(from = checkpoint.next_frame(), "resuming after checkpoint");
            let last = checkpoint.last_frame;
            self.update(id, |s| s.last_checkpoint = Some(last));
        } else if descriptor.resume {
            info!("no checkpoint found, starting from the first frame");
        }

        let (left, right) = self.env.open_sources(descriptor)?;
        let sink = self
            .env
            .open_sink(descriptor, resume.as_ref().map(|checkpoint| checkpoint.last_frame))?;
        let hook: CheckpointHook = {
            let shared = Arc::clone(self);
            Arc::new(move |checkpoint: &Checkpoint| {
                let last = checkpoint.last_frame;
                shared.update(id, |s| s.last_checkpoint = Some(last));
            })
        };

        let mut builder = PipelineSession::builder(id.to_string())
            .job_name(descriptor.name.clone())
            .device(device)
            .calibration(calibration)
            .config(self.config.clone())
            .sources(left, right)
            .sink(sink)
            .checkpoints(checkpoints)
            .cancel_token(cancel)
            .on_checkpoint(hook);
        if let Some(checkpoint) = resume {
            builder = builder.resume_from(checkpoint);
        }
        if let Some(tap) = &self.quality {
            builder = builder.quality_tap(tap.clone());
        }
        builder.build()?.run()
    }

    fn complete(&self, id: JobId, outcome: StitchResult<SessionReport>) {
        match &outcome {
            Ok(report) if report.cancelled => {
                info!(job_id = %id, last_checkpoint = ?report.last_checkpoint, "job cancelled")
            }
            Ok(report) => info!(
                job_id = %id,
                encoded = report.metrics.encoded,
                missing = report.metrics.missing,
                "job completed"
            ),
            Err(e) => error!(job_id = %id, error = %e, category = e.category(), "job failed"),
        }
        self.update(id, move |s| match outcome {
            Ok(report) => {
                if report.cancelled {
                    s.state = JobState::Failed;
                    s.failure = Some(CANCELLED.to_string());
                } else {
                    s.state = JobState::Completed;
                }
                s.last_checkpoint = report.last_checkpoint.or(s.last_checkpoint);
                s.report = Some(report);
            }
            Err(e) => {
                s.state = JobState::Failed;
                s.failure = Some(e.to_string());
            }
        });
    }
}

async fn run_claimed(shared: &Arc<Shared>, device: &Arc<DeviceContext>, claim: Claim) {
    let Claim { id, descriptor, cancel } = claim;
    let span = info_span!("job", job_id = %id, device = %device.id());
    info!(parent: &span, job = %descriptor.name, profile = %descriptor.calibration_profile, "job started");

    let runner = Arc::clone(shared);
    let device = Arc::clone(device);
    let outcome = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        runner.execute(id, &descriptor, device, cancel)
    })
    .await
    .unwrap_or_else(|e| Err(StitchError::state("running", "execute job", format!("pipeline task failed: {e}"))));
    shared.complete(id, outcome);
}

async fn device_worker(shared: Arc<Shared>, device: Arc<DeviceContext>) {
    let device_id = device.id();
    debug!(device = %device_id, "device worker started");
    loop {
        let notified = shared.work.notified();
        tokio::pin!(notified);
        // Register interest before looking at the queue so a submit in between wakes us.
        notified.as_mut().enable();

        if shared.shutdown.is_cancelled() {
            break;
        }
        match shared.claim_next(device_id) {
            Ok(Some(claim)) => {
                run_claimed(&shared, &device, claim).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(device = %device_id, error = %e, "job table unavailable");
                break;
            }
        }

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = &mut notified => {}
        }
    }
    debug!(device = %device_id, "device worker stopped");
}

/// Queue of whole-game jobs running on a fixed set of devices.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Starts one worker per device. Must be called within a tokio runtime.
    pub fn start(
        env: Arc<dyn JobEnvironment>,
        config: PipelineConfig,
        devices: Vec<Arc<DeviceContext>>,
    ) -> StitchResult<Self> {
        Self::start_with_tap(env, config, devices, None)
    }

    /// Like [`JobQueue::start`], publishing every job's quality events to `quality`.
    pub fn start_with_tap(
        env: Arc<dyn JobEnvironment>,
        config: PipelineConfig,
        devices: Vec<Arc<DeviceContext>>,
        quality: Option<QualityTap>,
    ) -> StitchResult<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(StitchError::validation("devices", "at least one device", "0"));
        }
        let shared = Arc::new(Shared {
            env,
            config,
            quality,
            table: Mutex::new(JobTable::default()),
            work: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let workers: Vec<_> = devices
            .into_iter()
            .map(|device| tokio::spawn(device_worker(Arc::clone(&shared), device)))
            .collect();
        info!(devices = workers.len(), "job queue started");
        Ok(Self { shared, workers })
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// Invalid descriptors, a job of the same name that has not finished yet, or a
    /// queue that is shutting down.
    pub fn submit(&self, descriptor: JobDescriptor) -> StitchResult<JobId> {
        descriptor.validate()?;
        if self.shared.shutdown.is_cancelled() {
            return Err(StitchError::state("shutting down", "submit", "the queue no longer accepts jobs"));
        }
        let id = {
            let mut table = self.shared.lock()?;
            let active = table
                .entries
                .values()
                .any(|e| e.descriptor.name == descriptor.name && !e.status.borrow().state.is_terminal());
            if active {
                return Err(StitchError::state(
                    "active",
                    "submit",
                    format!("job '{}' is already queued or running", descriptor.name),
                ));
            }
            table.next_id += 1;
            let id = JobId(table.next_id);
            let (status, _) = watch::channel(JobStatus::queued(id, &descriptor.name));
            info!(job_id = %id, job = %descriptor.name, resume = descriptor.resume, "job queued");
            table.entries.insert(
                id,
                JobEntry {
                    descriptor,
                    status,
                    cancel: CancellationToken::new(),
                },
            );
            table.pending.push_back(id);
            id
        };
        self.shared.work.notify_one();
        Ok(id)
    }

    /// Cancels a job. A queued job fails at once with reason `cancelled`; a running
    /// job stops admitting frames, drains, writes a final checkpoint and then fails
    /// the same way.
    pub fn cancel(&self, id: JobId) -> StitchResult<()> {
        let mut table = self.shared.lock()?;
        let state = {
            let entry = table.entries.get(&id).ok_or_else(|| unknown_job(id))?;
            let state = entry.status.borrow().state;
            match state {
                JobState::Queued => entry.status.send_modify(|s| {
                    s.state = JobState::Failed;
                    s.failure = Some(CANCELLED.to_string());
                }),
                JobState::Running => entry.cancel.cancel(),
                JobState::Completed | JobState::Failed => {
                    return Err(StitchError::state(state.to_string(), "cancel", format!("{id} already finished")));
                }
            }
            state
        };
        if state == JobState::Queued {
            table.pending.retain(|pending| *pending != id);
        }
        info!(job_id = %id, was = %state, "job cancel requested");
        Ok(())
    }

    pub fn status(&self, id: JobId) -> StitchResult<JobStatus> {
        let table = self.shared.lock()?;
        let entry = table.entries.get(&id).ok_or_else(|| unknown_job(id))?;
        let status = entry.status.borrow().clone();
        Ok(status)
    }

    /// Status of every job ever submitted, oldest first.
    pub fn jobs(&self) -> StitchResult<Vec<JobStatus>> {
        let table = self.shared.lock()?;
        let mut all: Vec<JobStatus> = table.entries.values().map(|e| e.status.borrow().clone()).collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }

    /// Watches a job's status.
    pub fn subscribe(&self, id: JobId) -> StitchResult<watch::Receiver<JobStatus>> {
        let table = self.shared.lock()?;
        let entry = table.entries.get(&id).ok_or_else(|| unknown_job(id))?;
        Ok(entry.status.subscribe())
    }

    /// Resolves once the job is completed or failed.
    pub async fn wait(&self, id: JobId) -> StitchResult<JobStatus> {
        let mut rx = self.subscribe(id)?;
        let status = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| StitchError::state("unknown", "wait", format!("{id} was dropped by the queue")))?;
        Ok((*status).clone())
    }

    /// Stops the workers. Queued jobs fail as cancelled; running jobs are cancelled
    /// and drain before their worker exits.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        match self.shared.lock() {
            Ok(mut table) => {
                let pending: Vec<JobId> = table.pending.drain(..).collect();
                for (id, entry) in &table.entries {
                    if pending.contains(id) {
                        entry.status.send_modify(|s| {
                            s.state = JobState::Failed;
                            s.failure = Some(CANCELLED.to_string());
                        });
                    } else {
                        entry.cancel.cancel();
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot cancel jobs on shutdown"),
        }
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                error!(error = %e, "device worker panicked");
            }
        }
        info!("job queue stopped");
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
