//! # Device Context and Completion Fences
//!
//! A [`DeviceContext`] models one accelerator: a single in-order work queue executing
//! submitted kernels on a dedicated thread. Submission returns immediately with a
//! [`Fence`] that signals once the kernel has run; the host only ever learns about
//! completion through fences.
//!
//! ## Architecture
//!
//! ```text
//! stage thread ──submit(kernel)──► [ in-order queue ] ──► device thread
//!       │                                                      │
//!       └──────────── Fence::wait() ◄──── signal(outcome) ─────┘
//! ```
//!
//! Kernels run strictly in submission order, so a kernel submitted after another one
//! observes all of its writes. Submission indices are monotonic per device and
//! [`DeviceContext::completed_index`] reports the newest finished submission.
//!
//! A panicking kernel is caught and reported through its fence as a kernel fault; the
//! device thread keeps serving the queue.

use crate::error::{StitchError, StitchResult};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Identifies one accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Position of a submission in a device's queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionIndex(pub u64);

#[derive(Clone, Debug)]
struct KernelFault {
    label: &'static str,
    reason: String,
}

#[derive(Default)]
struct FenceState {
    outcome: Mutex<Option<Result<(), KernelFault>>>,
    signaled: Condvar,
}

impl FenceState {
    fn signal(&self, outcome: Result<(), KernelFault>) {
        let mut slot = match self.outcome.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(outcome);
        self.signaled.notify_all();
    }
}

/// Completion signal of one submitted kernel.
#[derive(Clone)]
pub struct Fence {
    index: SubmissionIndex,
    state: Arc<FenceState>,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("index", &self.index)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Fence {
    pub fn index(&self) -> SubmissionIndex {
        self.index
    }

    /// Whether the kernel has finished, successfully or not.
    pub fn is_signaled(&self) -> bool {
        self.state.outcome.lock().map(|o| o.is_some()).unwrap_or(true)
    }

    /// Blocks until the kernel finished or `timeout` elapsed; returns whether it finished.
    ///
    /// A faulted kernel counts as finished: its buffers are no longer being touched.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut outcome) = self.state.outcome.lock() else {
            return true;
        };
        while outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            outcome = match self.state.signaled.wait_timeout(outcome, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return true,
            };
        }
        true
    }

    /// Blocks until the kernel finished and returns its outcome.
    pub fn wait(&self) -> StitchResult<()> {
        let mut outcome = self
            .state
            .outcome
            .lock()
            .map_err(|_| StitchError::poisoned("fence"))?;
        loop {
            if let Some(result) = outcome.as_ref() {
                return result
                    .clone()
                    .map_err(|fault| StitchError::kernel(fault.label, fault.reason));
            }
            outcome = self
                .state
                .signaled
                .wait(outcome)
                .map_err(|_| StitchError::poisoned("fence"))?;
        }
    }
}

/// A kernel submission whose result value is delivered alongside its fence.
pub struct Pending<T> {
    fence: Fence,
    result: Receiver<T>,
    label: &'static str,
}

impl<T> Pending<T> {
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Waits for the kernel and returns the value it produced.
    pub fn wait(self) -> StitchResult<T> {
        self.fence.wait()?;
        self.result
            .try_recv()
            .map_err(|_| StitchError::kernel(self.label, "kernel completed without producing a result"))
    }
}

type Kernel = Box<dyn FnOnce() -> StitchResult<()> + Send + 'static>;

struct Submission {
    index: SubmissionIndex,
    label: &'static str,
    kernel: Kernel,
    fence: Arc<FenceState>,
}

/// Handle to one accelerator's in-order work queue.
pub struct DeviceContext {
    id: DeviceId,
    queue: Mutex<Option<(u64, Sender<Submission>)>>,
    completed: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceContext {
    /// Starts the device thread.
    pub fn new(id: DeviceId) -> StitchResult<Arc<Self>> {
        let (tx, rx) = crossbeam_channel::unbounded::<Submission>();
        let completed = Arc::new(AtomicU64::new(0));
        let worker_completed = Arc::clone(&completed);
        let worker = std::thread::Builder::new()
            .name(format!("{id}-queue"))
            .spawn(move || run_queue(id, rx, worker_completed))
            .map_err(|e| StitchError::io("spawn device queue", e))?;
        debug!(device = %id, "device queue started");
        Ok(Arc::new(Self {
            id,
            queue: Mutex::new(Some((1, tx))),
            completed,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Enqueues `kernel`; the returned fence signals once it has run.
    pub fn submit<F>(&self, label: &'static str, kernel: F) -> StitchResult<Fence>
    where
        F: FnOnce() -> StitchResult<()> + Send + 'static,
    {
        let state = Arc::new(FenceState::default());
        let mut queue = self.queue.lock().map_err(|_| StitchError::poisoned("device queue"))?;
        let Some((next, tx)) = queue.as_mut() else {
            return Err(StitchError::state("shut down", "submit", format!("{} no longer accepts work", self.id)));
        };
        let index = SubmissionIndex(*next);
        *next += 1;
        tx.send(Submission {
            index,
            label,
            kernel: Box::new(kernel),
            fence: Arc::clone(&state),
        })
        .map_err(|_| StitchError::state("stopped", "submit", format!("{} queue thread exited", self.id)))?;
        Ok(Fence { index, state })
    }

    /// Enqueues a kernel that produces a value.
    pub fn submit_with_result<T, F>(&self, label: &'static str, kernel: F) -> StitchResult<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> StitchResult<T> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fence = self.submit(label, move || {
            let value = kernel()?;
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(value);
            Ok(())
        })?;
        Ok(Pending {
            fence,
            result: rx,
            label,
        })
    }

    /// Newest submission known to have finished.
    pub fn completed_index(&self) -> SubmissionIndex {
        SubmissionIndex(self.completed.load(Ordering::Acquire))
    }

    /// Waits for everything submitted so far.
    pub fn synchronize(&self) -> StitchResult<()> {
        self.submit("synchronize", || Ok(()))?.wait()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    error!(device = %self.id, "device queue thread panicked");
                }
            }
        }
    }
}

fn run_queue(id: DeviceId, rx: Receiver<Submission>, completed: Arc<AtomicU64>) {
    for submission in rx.iter() {
        let Submission {
            index,
            label,
            kernel,
            fence,
        } = submission;
        let outcome = match catch_unwind(AssertUnwindSafe(kernel)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(KernelFault {
                label,
                reason: e.to_string(),
            }),
            Err(_) => {
                error!(device = %id, kernel = label, "kernel panicked");
                Err(KernelFault {
                    label,
                    reason: "kernel panicked".to_string(),
                })
            }
        };
        completed.store(index.0, Ordering::Release);
        fence.signal(outcome);
    }
    debug!(device = %id, "device queue drained");
}
