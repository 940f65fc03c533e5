//! # Quality Tap
//!
//! A side channel of per-frame quality annotations for live monitoring: degraded and
//! missing flags plus the alignment and color state the frame was produced with. The
//! tap never slows the pipeline down. When nobody drains it fast enough, events are
//! discarded and counted.

use crate::core::frame::{FrameFlags, FrameIndex};
use crate::processing::{AlignmentPrior, ColorEstimate};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Quality annotation of one output frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityEvent {
    pub job_id: String,
    pub index: FrameIndex,
    pub timestamp_ns: u64,
    pub flags: FrameFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentPrior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorEstimate>,
}

/// Publishing end, held by the encoder worker.
#[derive(Clone)]
pub struct QualityTap {
    tx: Sender<QualityEvent>,
    overflow: Arc<AtomicU64>,
}

/// Subscribing end.
pub struct QualityFeed {
    rx: Receiver<QualityEvent>,
    overflow: Arc<AtomicU64>,
}

/// Creates a tap buffering at most `depth` events.
pub fn quality_tap(depth: usize) -> (QualityTap, QualityFeed) {
    let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
    let overflow = Arc::new(AtomicU64::new(0));
    (
        QualityTap {
            tx,
            overflow: Arc::clone(&overflow),
        },
        QualityFeed { rx, overflow },
    )
}

impl QualityTap {
    pub fn publish(&self, event: QualityEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
            // Subscriber gone; monitoring is optional.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl QualityFeed {
    pub fn try_next(&self) -> Option<QualityEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocks until the next event or until every tap is dropped.
    pub fn next_event(&self) -> Option<QualityEvent> {
        self.rx.recv().ok()
    }

    pub fn drain(&self) -> Vec<QualityEvent> {
        self.rx.try_iter().collect()
    }

    /// Events discarded because the feed was full.
    pub fn overflowed(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
