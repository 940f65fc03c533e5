//! # Checkpoints
//!
//! Durable per-job progress: the last frame whose output is known to be on disk, plus
//! the smoothed stage state after it. Resuming restores that state and continues at the
//! next frame, which reproduces the uninterrupted output exactly.
//!
//! ## On-disk Format
//!
//! `<dir>/<job>.checkpoint.json` holds an envelope:
//!
//! ```text
//! { "version": 1, "digest": "<sha256 of body, hex>", "body": "<checkpoint JSON>" }
//! ```
//!
//! The body is stored as a string so the digest covers the exact bytes that get parsed.
//! Files are written to a temporary sibling and renamed into place, so a crash leaves
//! either the old checkpoint or the new one. Anything that fails to parse or verify is
//! corruption and fails the job.

use crate::core::frame::FrameIndex;
use crate::error::{StitchError, StitchResult};
use crate::processing::StageSnapshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

/// Progress record of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Job name from the descriptor; stable across resubmissions
    pub job: String,
    pub profile_id: String,
    pub last_frame: FrameIndex,
    pub state: StageSnapshot,
}

impl Checkpoint {
    /// First frame a resumed run processes.
    pub fn next_frame(&self) -> FrameIndex {
        self.last_frame + 1
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    digest: String,
    body: String,
}

fn digest_hex(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Directory of checkpoint files, one per job name.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}.checkpoint.json"))
    }

    /// Atomically replaces the checkpoint of `checkpoint.job`.
    pub fn save(&self, checkpoint: &Checkpoint) -> StitchResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| StitchError::io_at("create checkpoint dir", &self.dir, e))?;
        let body = serde_json::to_string(checkpoint)?;
        let envelope = Envelope {
            version: FORMAT_VERSION,
            digest: digest_hex(&body),
            body,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let path = self.path_for(&checkpoint.job);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| StitchError::io_at("create checkpoint", &self.dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StitchError::io_at("write checkpoint", tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StitchError::io_at("persist checkpoint", &path, e.error))?;
        debug!(job = %checkpoint.job, frame = checkpoint.last_frame, "checkpoint saved");
        Ok(())
    }

    /// Loads the checkpoint of `job`; `None` when there is none.
    ///
    /// # Errors
    ///
    /// A fatal [`StitchError::Checkpoint`] when the file exists but is corrupt, of an
    /// unknown version, or belongs to another job.
    pub fn load(&self, job: &str) -> StitchResult<Option<Checkpoint>> {
        let path = self.path_for(job);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StitchError::io_at("read checkpoint", &path, e)),
        };
        let corrupt = |reason: String| {
            StitchError::checkpoint(job, reason)
                .escalate("checkpoint corrupt")
                .with_recovery_suggestion("Delete the checkpoint file and resubmit without resume")
        };

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("unreadable envelope: {e}")))?;
        if envelope.version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", envelope.version)));
        }
        if digest_hex(&envelope.body) != envelope.digest {
            return Err(corrupt("digest mismatch".to_string()));
        }
        let checkpoint: Checkpoint =
            serde_json::from_str(&envelope.body).map_err(|e| corrupt(format!("unreadable body: {e}")))?;
        if checkpoint.job != job {
            return Err(corrupt(format!("file belongs to job '{}'", checkpoint.job)));
        }
        info!(job, frame = checkpoint.last_frame, "checkpoint loaded");
        Ok(Some(checkpoint))
    }

    /// Deletes the checkpoint of `job`, if any.
    pub fn remove(&self, job: &str) -> StitchResult<()> {
        let path = self.path_for(job);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StitchError::io_at("remove checkpoint", &path, e)),
        }
    }
}
