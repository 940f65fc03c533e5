//! # Pipeline Session
//!
//! Runs one job's frames through the four stages. A session owns everything with
//! per-job lifetime: the memory pools, the stage instances and their smoothed state, the
//! queues between them and the checkpoint cursor.
//!
//! ## Architecture
//!
//! ```text
//!  ingest ──q──► undistort ──q──► color ──q──► stitch ──q──► codec ══handoff══► encoder
//!  (paced)                                                                    (checkpoints)
//! ```
//!
//! Every box is its own thread and every arrow a bounded queue, so a slow encoder
//! eventually blocks frame admission instead of growing memory. Frames stay in index
//! order end to end; a frame that cannot be produced is replaced by a missing marker
//! rather than skipped, and the encoder sees each index exactly once.
//!
//! ## Error Handling
//!
//! Each stage error is classified:
//! - **transient**: the frame is retried up to `frame_retry_limit` times, then dropped
//!   with a missing marker when the error allows it;
//! - **sync rejection**: the pair is dropped with a marker, and a run of more than
//!   `max_consecutive_desync` rejections fails the job;
//! - **fatal**: the session stops at once and returns the error.
//!
//! More than `max_consecutive_drops` missing frames in a row also fails the job.
//!
//! ## Cancellation
//!
//! The cancellation token is checked before each frame is admitted. Frames already in
//! flight finish and are encoded, and the final checkpoint covers them.

use crate::calibration::CalibrationProfile;
use crate::capture::{FramePairer, FrameSource, RawPair};
use crate::config::PipelineConfig;
use crate::core::buffer_pool::{MemoryManager, PoolStats, SizeClass};
use crate::core::device::DeviceContext;
use crate::core::frame::{Frame, FrameIndex, FramePair, MissingReason};
use crate::core::metrics::{MetricsReport, PipelineMetrics};
use crate::core::stage_queue::{QueueReceiver, QueueSender, stage_queue};
use crate::error::{Retryable, StitchError, StitchResult, classify, operations};
use crate::jobs::checkpoint::{Checkpoint, CheckpointStore};
use crate::processing::{
    CodecHandoffStage, ColorMatchStage, EncoderInput, EncoderSink, Packet, Picture, PipelineStage, StageContext,
    StageKind, StageSnapshot, StitchStage, UndistortStage, handoff_queue,
};
use crate::quality::{QualityEvent, QualityTap};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

/// Called after every checkpoint is saved.
pub type CheckpointHook = Arc<dyn Fn(&Checkpoint) + Send + Sync>;

/// Bytes per buffer of `class` for a calibration profile.
pub fn buffer_bytes(calibration: &CalibrationProfile, class: SizeClass) -> usize {
    match class {
        SizeClass::Raw => calibration.raw_resolution().byte_len(),
        SizeClass::Rectified | SizeClass::Matched => calibration.rectified_resolution().byte_len(),
        SizeClass::Panorama => calibration.panorama().byte_len(),
    }
}

/// Outcome of a session that was not aborted.
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub job_id: String,
    /// First frame this session admitted
    pub first_frame: FrameIndex,
    pub last_completed: Option<FrameIndex>,
    pub last_checkpoint: Option<FrameIndex>,
    pub cancelled: bool,
    pub metrics: MetricsReport,
    pub pools: Vec<(SizeClass, PoolStats)>,
}

/// One configured run of the pipeline.
pub struct PipelineSession {
    job_id: String,
    job_name: String,
    device: Arc<DeviceContext>,
    calibration: Arc<CalibrationProfile>,
    config: Arc<PipelineConfig>,
    pairer: FramePairer,
    sink: Box<dyn EncoderSink>,
    checkpoints: Option<CheckpointStore>,
    resume: Option<Checkpoint>,
    cancel: CancellationToken,
    quality: Option<QualityTap>,
    on_checkpoint: Option<CheckpointHook>,
}

impl PipelineSession {
    pub fn builder(job_id: impl Into<String>) -> PipelineSessionBuilder {
        PipelineSessionBuilder::new(job_id)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// First frame this session will admit.
    pub fn first_frame(&self) -> FrameIndex {
        self.resume.as_ref().map_or(0, Checkpoint::next_frame)
    }

    /// Runs to the end of the sources, cancellation, or the first fatal error.
    pub fn run(self) -> StitchResult<SessionReport> {
        let first_frame = self.first_frame();
        let PipelineSession {
            job_id,
            job_name,
            device,
            calibration,
            config,
            pairer,
            sink,
            checkpoints,
            resume,
            cancel,
            quality,
            on_checkpoint,
        } = self;

        let memory = MemoryManager::new(config.pool_hard_cap, config.acquire_timeout());
        for (class, count) in config.pool_plan() {
            memory.configure_class(class, buffer_bytes(&calibration, class), count)?;
        }
        let ctx = StageContext {
            device: Arc::clone(&device),
            memory: Arc::clone(&memory),
            calibration: Arc::clone(&calibration),
            config: Arc::clone(&config),
        };

        let (handoff_tx, handoff_rx) = handoff_queue(config.encoder_queue_depth);
        let mut stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(UndistortStage::new(ctx.clone())),
            Box::new(ColorMatchStage::new(ctx.clone())),
            Box::new(StitchStage::new(ctx.clone())),
            Box::new(CodecHandoffStage::new(job_id.clone(), handoff_tx, config.handoff_timeout())),
        ];
        for stage in &mut stages {
            stage.reset();
            if let Some(checkpoint) = &resume {
                stage.restore(&checkpoint.state);
            }
        }

        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for kind in StageKind::ORDER {
            let (tx, rx) = stage_queue::<Packet>(kind.name(), config.queue_depth);
            senders.push(tx);
            receivers.push(rx);
        }
        let mut gauges: Vec<_> = receivers.iter().map(QueueReceiver::gauge).collect();
        gauges.push(handoff_rx.gauge());
        let mut outputs: Vec<Option<QueueSender<Packet>>> = senders.into_iter().map(Some).collect();
        let ingest_tx = outputs.remove(0);
        outputs.push(None);

        let metrics = PipelineMetrics::new();
        metrics.record_skipped(first_frame);
        let control = PipelineControl::new(cancel.clone());
        let mut tracker = CompletionTracker {
            job_id: &job_id,
            job_name: &job_name,
            profile_id: calibration.profile_id(),
            sink,
            checkpoints: checkpoints.as_ref(),
            on_checkpoint: on_checkpoint.as_ref(),
            quality,
            interval: config.checkpoint_interval,
            max_drops: config.max_consecutive_drops,
            metrics: &metrics,
            next: first_frame,
            consecutive_drops: 0,
            last_completed: resume.as_ref().map(|c| c.last_frame),
            last_checkpoint: resume.as_ref().map(|c| c.last_frame),
            last_state: resume.as_ref().map(|c| c.state.clone()).unwrap_or_default(),
        };

        info!(
            job_id = %job_id,
            device = %device.id(),
            profile = calibration.profile_id(),
            first_frame,
            frames = pairer.frame_count(),
            "session starting"
        );
        let started = Instant::now();
        std::thread::scope(|scope| {
            let (ctx, config, metrics, control) = (&ctx, &config, &metrics, &control);
            let job_id = job_id.as_str();

            if let Some(tx) = ingest_tx {
                scope.spawn(move || {
                    let _span = info_span!("ingest", job_id).entered();
                    run_ingest(pairer, ctx, config, first_frame, tx, metrics, control);
                });
            }
            for ((mut stage, input), output) in stages.into_iter().zip(receivers).zip(outputs) {
                scope.spawn(move || {
                    let _span = info_span!("stage", job_id, stage = %stage.kind()).entered();
                    run_stage(stage.as_mut(), input, output, config.frame_retry_limit, metrics, control);
                });
            }
            let _span = info_span!("encoder", job_id).entered();
            run_encoder(&mut tracker, handoff_rx, control);
        });
        let elapsed = started.elapsed();

        let last_completed = tracker.last_completed;
        let last_checkpoint = tracker.last_checkpoint;
        drop(tracker);
        let report = metrics.report(elapsed, gauges.iter().map(|g| g.snapshot()).collect());
        if let Some(failure) = control.take_failure() {
            error!(job_id = %job_id, error = %failure, "session aborted");
            return Err(failure);
        }
        let cancelled = cancel.is_cancelled();
        info!(
            job_id = %job_id,
            encoded = report.encoded,
            missing = report.missing,
            degraded = report.degraded,
            fps = format!("{:.1}", report.delivered_fps),
            cancelled,
            "session finished"
        );
        debug!("\n{}", report.render());
        Ok(SessionReport {
            job_id,
            first_frame,
            last_completed,
            last_checkpoint,
            cancelled,
            metrics: report,
            pools: memory.all_stats(),
        })
    }
}

/// Fluent construction of a [`PipelineSession`].
pub struct PipelineSessionBuilder {
    job_id: String,
    job_name: Option<String>,
    device: Option<Arc<DeviceContext>>,
    calibration: Option<Arc<CalibrationProfile>>,
    config: PipelineConfig,
    sources: Option<(Box<dyn FrameSource>, Box<dyn FrameSource>)>,
    sink: Option<Box<dyn EncoderSink>>,
    checkpoints: Option<CheckpointStore>,
    resume: Option<Checkpoint>,
    cancel: CancellationToken,
    quality: Option<QualityTap>,
    on_checkpoint: Option<CheckpointHook>,
}

impl PipelineSessionBuilder {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: None,
            device: None,
            calibration: None,
            config: PipelineConfig::default(),
            sources: None,
            sink: None,
            checkpoints: None,
            resume: None,
            cancel: CancellationToken::new(),
            quality: None,
            on_checkpoint: None,
        }
    }

    /// Name checkpoints are stored under. Defaults to the job id.
    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn device(mut self, device: Arc<DeviceContext>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn calibration(mut self, calibration: Arc<CalibrationProfile>) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sources(mut self, left: impl FrameSource + 'static, right: impl FrameSource + 'static) -> Self {
        self.sources = Some((Box::new(left), Box::new(right)));
        self
    }

    pub fn sink(mut self, sink: impl EncoderSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Continues after `checkpoint` with its stage state restored.
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn quality_tap(mut self, tap: QualityTap) -> Self {
        self.quality = Some(tap);
        self
    }

    pub fn on_checkpoint(mut self, hook: CheckpointHook) -> Self {
        self.on_checkpoint = Some(hook);
        self
    }

    /// Validates the configuration and checks the sources and checkpoint against the
    /// calibration profile.
    pub fn build(self) -> StitchResult<PipelineSession> {
        self.config.validate()?;
        let device = self
            .device
            .ok_or_else(|| StitchError::validation("device", "a device is required", "none"))?;
        let calibration = self
            .calibration
            .ok_or_else(|| StitchError::validation("calibration", "a calibration profile is required", "none"))?;
        let (left, right) = self
            .sources
            .ok_or_else(|| StitchError::validation("sources", "both camera sources are required", "none"))?;
        let sink = self
            .sink
            .ok_or_else(|| StitchError::validation("sink", "an encoder sink is required", "none"))?;

        let pairer = FramePairer::new(left, right, self.config.sync_tolerance_ns())
            .map_err(|e| e.escalate("sources unusable"))?;
        calibration
            .verify_sources(&pairer.describe())
            .map_err(|e| e.escalate("calibration mismatch"))?;
        if let Some(checkpoint) = &self.resume {
            if checkpoint.profile_id != calibration.profile_id() {
                return Err(StitchError::calibration(
                    calibration.profile_id(),
                    format!("checkpoint was recorded with profile '{}'", checkpoint.profile_id),
                )
                .escalate("calibration mismatch"));
            }
        }

        Ok(PipelineSession {
            job_name: self.job_name.unwrap_or_else(|| self.job_id.clone()),
            job_id: self.job_id,
            device,
            calibration,
            config: Arc::new(self.config),
            pairer,
            sink,
            checkpoints: self.checkpoints,
            resume: self.resume,
            cancel: self.cancel,
            quality: self.quality,
            on_checkpoint: self.on_checkpoint,
        })
    }
}

/// Cancellation and first-failure bookkeeping shared by the session threads.
struct PipelineControl {
    cancel: CancellationToken,
    failed: AtomicBool,
    failure: Mutex<Option<StitchError>>,
}

impl PipelineControl {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn fail(&self, error: StitchError) {
        warn!(error = %error, category = error.category(), "pipeline failure");
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(error);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn should_stop_admitting(&self) -> bool {
        self.is_failed() || self.cancel.is_cancelled()
    }

    fn take_failure(&self) -> Option<StitchError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Runs `op` again while it fails transiently, at most `limit` extra times.
fn with_retries<T>(
    limit: u32,
    metrics: &PipelineMetrics,
    mut op: impl FnMut() -> StitchResult<T>,
) -> StitchResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < limit && classify::is_transient(&e) => {
                attempt += 1;
                metrics.record_retry();
                debug!(attempt, error = %e, "retrying");
                if let Some(ms) = e.retry_delay_ms() {
                    std::thread::sleep(Duration::from_millis(ms));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn nominal_timestamp(index: FrameIndex, fps: f64) -> u64 {
    (index as f64 * 1e9 / fps).round() as u64
}

fn missing_reason(error: &StitchError) -> MissingReason {
    if error.is_timeout_of(operations::BUFFER_ACQUIRE) {
        MissingReason::BufferStarved
    } else {
        MissingReason::StageFault
    }
}

/// Moves a host pair into device buffers.
fn admit(ctx: &StageContext, raw: RawPair, retry_limit: u32, metrics: &PipelineMetrics) -> StitchResult<Packet> {
    let left_lease = with_retries(retry_limit, metrics, || ctx.memory.acquire(SizeClass::Raw))?;
    let right_lease = with_retries(retry_limit, metrics, || ctx.memory.acquire(SizeClass::Raw))?;
    let left = Frame::upload_into(&ctx.device, left_lease, raw.left)?;
    let right = Frame::upload_into(&ctx.device, right_lease, raw.right)?;
    Ok(Packet::pair(raw.index, FramePair { left, right }))
}

fn run_ingest(
    mut pairer: FramePairer,
    ctx: &StageContext,
    config: &PipelineConfig,
    first_frame: FrameIndex,
    tx: QueueSender<Packet>,
    metrics: &PipelineMetrics,
    control: &PipelineControl,
) {
    let interval = config.frame_interval();
    let mut deadline = Instant::now();
    let mut desync_run = 0u32;

    for index in first_frame..pairer.frame_count() {
        if control.should_stop_admitting() {
            debug!(frame = index, "admission stopped");
            break;
        }
        if config.pace_admission {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            deadline = deadline.max(now) + interval;
        }

        let packet = match with_retries(config.frame_retry_limit, metrics, || pairer.read_pair(index)) {
            Ok(Some(raw)) => {
                desync_run = 0;
                let timestamp = raw.timestamp_ns();
                match admit(ctx, raw, config.frame_retry_limit, metrics) {
                    Ok(packet) => packet,
                    Err(e) if classify::allows_frame_drop(&e) => {
                        metrics.record_stage_fault();
                        warn!(frame = index, error = %e, "frame not admitted");
                        Packet::missing(index, timestamp, missing_reason(&e))
                    }
                    Err(e) => {
                        control.fail(e);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) if classify::class_of(&e) == classify::ErrorClass::SyncRejection => {
                metrics.record_sync_rejection();
                desync_run += 1;
                if desync_run > config.max_consecutive_desync {
                    control.fail(e.escalate(format!("{desync_run} consecutive pairs out of sync")));
                    break;
                }
                warn!(frame = index, error = %e, "pair rejected");
                Packet::missing(index, nominal_timestamp(index, config.target_fps), MissingReason::SyncRejected)
            }
            Err(e) if classify::allows_frame_drop(&e) => {
                metrics.record_source_fault();
                warn!(frame = index, error = %e, "source fault, dropping frame");
                Packet::missing(index, nominal_timestamp(index, config.target_fps), MissingReason::SourceFault)
            }
            Err(e) => {
                control.fail(e);
                break;
            }
        };

        metrics.record_admitted();
        if tx.push(packet).is_err() {
            break;
        }
    }
}

fn run_stage(
    stage: &mut dyn PipelineStage,
    input: QueueReceiver<Packet>,
    output: Option<QueueSender<Packet>>,
    retry_limit: u32,
    metrics: &PipelineMetrics,
    control: &PipelineControl,
) {
    for packet in input {
        if control.is_failed() {
            break;
        }
        let outcome = if packet.is_missing() {
            with_retries(retry_limit, metrics, || stage.pass_missing(&packet))
        } else {
            match with_retries(retry_limit, metrics, || stage.process(&packet)) {
                Err(e) if classify::allows_frame_drop(&e) => {
                    metrics.record_stage_fault();
                    warn!(frame = packet.index, error = %e, "stage fault, dropping frame");
                    let dropped = packet.to_missing(missing_reason(&e));
                    with_retries(retry_limit, metrics, || stage.pass_missing(&dropped))
                }
                other => other,
            }
        };
        let mut out = match outcome {
            Ok(out) => out,
            Err(e) => {
                control.fail(e.with_context(format!("{} stage, frame {}", stage.kind(), packet.index)));
                break;
            }
        };
        stage.snapshot(&mut out.state);
        if let Some(tx) = &output {
            if tx.push(out).is_err() {
                break;
            }
        }
    }
    if let Err(e) = stage.finish() {
        control.fail(e);
    }
}

fn run_encoder(tracker: &mut CompletionTracker<'_>, input: QueueReceiver<EncoderInput>, control: &PipelineControl) {
    for item in input {
        if control.is_failed() {
            return;
        }
        if let Err(e) = tracker.complete(item) {
            control.fail(e);
            return;
        }
    }
    if control.is_failed() {
        return;
    }
    if let Err(e) = tracker.finish() {
        control.fail(e);
    }
}

/// Feeds the encoder in index order and decides when progress is durable.
struct CompletionTracker<'a> {
    job_id: &'a str,
    job_name: &'a str,
    profile_id: &'a str,
    sink: Box<dyn EncoderSink>,
    checkpoints: Option<&'a CheckpointStore>,
    on_checkpoint: Option<&'a CheckpointHook>,
    quality: Option<QualityTap>,
    interval: u64,
    max_drops: u32,
    metrics: &'a PipelineMetrics,
    next: FrameIndex,
    consecutive_drops: u32,
    last_completed: Option<FrameIndex>,
    last_checkpoint: Option<FrameIndex>,
    last_state: StageSnapshot,
}

impl CompletionTracker<'_> {
    fn complete(&mut self, input: EncoderInput) -> StitchResult<()> {
        let index = input.tag().index;
        if index != self.next {
            return Err(StitchError::state(
                format!("expecting frame {}", self.next),
                "complete",
                format!("frame {index} arrived out of order"),
            ));
        }

        match &input {
            EncoderInput::Frame { tag, frame, flags, .. } => {
                let pixels = frame.buffer.read()?;
                self.sink.encode(&Picture {
                    tag,
                    resolution: frame.resolution,
                    pixels: &pixels[..frame.resolution.byte_len()],
                    flags,
                })?;
                self.metrics.record_encoded(flags.is_degraded());
                self.consecutive_drops = 0;
            }
            EncoderInput::Missing { tag, reason, .. } => {
                self.sink.mark_missing(tag, *reason)?;
                self.metrics.record_missing();
                self.consecutive_drops += 1;
                if self.consecutive_drops > self.max_drops {
                    return Err(StitchError::resource(
                        "frames",
                        format!("{} consecutive frames dropped, last at {index}", self.consecutive_drops),
                    )
                    .escalate("sustained frame loss"));
                }
            }
        }

        if let Some(tap) = &self.quality {
            tap.publish(QualityEvent {
                job_id: self.job_id.to_string(),
                index,
                timestamp_ns: input.tag().timestamp_ns,
                flags: input.flags().clone(),
                alignment: input.state().alignment,
                color: input.state().color,
            });
        }

        self.next = index + 1;
        self.last_completed = Some(index);
        self.last_state = input.state().clone();
        if (index + 1) % self.interval == 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Syncs the sink, then records the last completed frame.
    fn checkpoint(&mut self) -> StitchResult<()> {
        let Some(last) = self.last_completed else {
            return Ok(());
        };
        if self.last_checkpoint == Some(last) {
            return Ok(());
        }
        self.sink.sync()?;
        if let Some(store) = self.checkpoints {
            let checkpoint = Checkpoint {
                job: self.job_name.to_string(),
                profile_id: self.profile_id.to_string(),
                last_frame: last,
                state: self.last_state.clone(),
            };
            store.save(&checkpoint)?;
            if let Some(hook) = self.on_checkpoint {
                hook(&checkpoint);
            }
        }
        self.last_checkpoint = Some(last);
        Ok(())
    }

    fn finish(&mut self) -> StitchResult<()> {
        self.sink.finish()?;
        self.checkpoint()
    }
}
