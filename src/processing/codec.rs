//! # Codec Handoff Stage
//!
//! Hands finished panoramas, in frame order, to the encoder through a bounded queue. When
//! the encoder lags the queue fills, the push blocks, and backpressure reaches the
//! stitcher and finally frame admission. A push that stays blocked past the handoff
//! timeout is retried by the runner; a panorama that made it this far is never dropped
//! for being slow.
//!
//! Missing markers travel the same queue so the encoder sees every index exactly once.
//!
//! The encoder itself sits behind [`EncoderSink`]. [`RawFileSink`] is the built-in one:
//! it appends RGB8 panoramas to `frames.rgb` and describes each index with one JSON line
//! in `index.jsonl`, which is all the post-game tooling needs to mux a stream.

use crate::core::frame::{DegradedReason, Frame, FrameFlags, FrameIndex, MissingReason, Resolution};
use crate::core::stage_queue::{PushError, QueueReceiver, QueueSender, stage_queue};
use crate::error::{StitchError, StitchResult, operations};
use crate::processing::processing::{Packet, Payload, PipelineStage, StageKind, StageSnapshot};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Identity of one output frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTag {
    pub job_id: String,
    pub index: FrameIndex,
    pub timestamp_ns: u64,
}

/// One entry of the handoff queue.
#[derive(Debug)]
pub enum EncoderInput {
    Frame {
        tag: FrameTag,
        frame: Frame,
        flags: FrameFlags,
        state: StageSnapshot,
    },
    Missing {
        tag: FrameTag,
        reason: MissingReason,
        flags: FrameFlags,
        state: StageSnapshot,
    },
}

impl EncoderInput {
    pub fn tag(&self) -> &FrameTag {
        match self {
            EncoderInput::Frame { tag, .. } | EncoderInput::Missing { tag, .. } => tag,
        }
    }

    pub fn flags(&self) -> &FrameFlags {
        match self {
            EncoderInput::Frame { flags, .. } | EncoderInput::Missing { flags, .. } => flags,
        }
    }

    /// Stage state after this frame, as stored with its checkpoint.
    pub fn state(&self) -> &StageSnapshot {
        match self {
            EncoderInput::Frame { state, .. } | EncoderInput::Missing { state, .. } => state,
        }
    }
}

/// Creates the bounded queue between the handoff stage and the encoder worker.
pub fn handoff_queue(depth: usize) -> (QueueSender<EncoderInput>, QueueReceiver<EncoderInput>) {
    stage_queue("encoder", depth)
}

/// A host-side view of one panorama for the encoder.
pub struct Picture<'a> {
    pub tag: &'a FrameTag,
    pub resolution: Resolution,
    pub pixels: &'a [u8],
    pub flags: &'a FrameFlags,
}

/// Destination of finished frames.
pub trait EncoderSink: Send {
    fn encode(&mut self, picture: &Picture<'_>) -> StitchResult<()>;

    /// Records that `tag` has no picture.
    fn mark_missing(&mut self, tag: &FrameTag, reason: MissingReason) -> StitchResult<()>;

    /// Makes everything written so far durable. Called before each checkpoint.
    fn sync(&mut self) -> StitchResult<()>;

    fn finish(&mut self) -> StitchResult<()>;
}

impl<S: EncoderSink + ?Sized> EncoderSink for Box<S> {
    fn encode(&mut self, picture: &Picture<'_>) -> StitchResult<()> {
        (**self).encode(picture)
    }

    fn mark_missing(&mut self, tag: &FrameTag, reason: MissingReason) -> StitchResult<()> {
        (**self).mark_missing(tag, reason)
    }

    fn sync(&mut self) -> StitchResult<()> {
        (**self).sync()
    }

    fn finish(&mut self) -> StitchResult<()> {
        (**self).finish()
    }
}

/// Pushes panoramas and missing markers onto the handoff queue.
pub struct CodecHandoffStage {
    job_id: String,
    tx: Option<QueueSender<EncoderInput>>,
    timeout: Duration,
}

impl CodecHandoffStage {
    pub fn new(job_id: impl Into<String>, tx: QueueSender<EncoderInput>, timeout: Duration) -> Self {
        Self {
            job_id: job_id.into(),
            tx: Some(tx),
            timeout,
        }
    }

    fn tag(&self, packet: &Packet) -> FrameTag {
        FrameTag {
            job_id: self.job_id.clone(),
            index: packet.index,
            timestamp_ns: packet.timestamp_ns,
        }
    }

    fn hand_off(&self, input: EncoderInput) -> StitchResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| StitchError::state("finished", "hand_off", "handoff queue already closed"))?;
        match tx.push_timeout(input, self.timeout) {
            Ok(()) => Ok(()),
            Err(PushError::Timeout(input)) => {
                debug!(frame = input.tag().index, "encoder queue full");
                Err(StitchError::timeout(
                    operations::ENCODER_HANDOFF,
                    self.timeout.as_millis() as u64,
                ))
            }
            Err(PushError::Disconnected(input)) => Err(StitchError::encoder(format!(
                "encoder went away before frame {}",
                input.tag().index
            ))),
        }
    }
}

impl PipelineStage for CodecHandoffStage {
    fn kind(&self) -> StageKind {
        StageKind::CodecHandoff
    }

    fn process(&mut self, packet: &Packet) -> StitchResult<Packet> {
        let frame = packet.expect_panorama(self.kind())?;
        self.hand_off(EncoderInput::Frame {
            tag: self.tag(packet),
            frame: frame.clone(),
            flags: packet.flags.clone(),
            state: packet.state.clone(),
        })?;
        Ok(packet.with_payload(Payload::Delivered))
    }

    fn pass_missing(&mut self, packet: &Packet) -> StitchResult<Packet> {
        let reason = packet.flags.missing.unwrap_or(MissingReason::StageFault);
        self.hand_off(EncoderInput::Missing {
            tag: self.tag(packet),
            reason,
            flags: packet.flags.clone(),
            state: packet.state.clone(),
        })?;
        Ok(packet.clone())
    }

    fn finish(&mut self) -> StitchResult<()> {
        // Closing the queue tells the encoder worker the stream is complete.
        self.tx = None;
        Ok(())
    }
}

const FRAMES_FILE: &str = "frames.rgb";
const INDEX_FILE: &str = "index.jsonl";

/// One line of `index.jsonl`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index: FrameIndex,
    pub timestamp_ns: u64,
    /// Byte offset of the frame in `frames.rgb`
    pub offset: u64,
    /// Zero for missing frames
    pub len: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<MissingReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedReason>,
}

/// Raw RGB8 frame file plus a JSON-lines index.
pub struct RawFileSink {
    dir: PathBuf,
    frames: BufWriter<File>,
    index: BufWriter<File>,
    offset: u64,
    last_resolution: Resolution,
}

impl RawFileSink {
    /// Starts a fresh output in `dir`, discarding any previous one.
    pub fn create(dir: impl AsRef<Path>) -> StitchResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StitchError::io_at("create output dir", &dir, e))?;
        let frames = open_truncated(&dir.join(FRAMES_FILE))?;
        let index = open_truncated(&dir.join(INDEX_FILE))?;
        info!(dir = %dir.display(), "raw panorama output created");
        Ok(Self {
            dir,
            frames: BufWriter::new(frames),
            index: BufWriter::new(index),
            offset: 0,
            last_resolution: Resolution::new(0, 0),
        })
    }

    /// Reopens an output for appending after frame `last`, dropping anything written
    /// past it.
    ///
    /// # Errors
    ///
    /// [`StitchError::Checkpoint`] when the output holds fewer than `last + 1` frames
    /// or its index is not a contiguous run from zero.
    pub fn resume(dir: impl AsRef<Path>, last: FrameIndex) -> StitchResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let entries = Self::read_index(&dir)?;
        let kept: Vec<IndexEntry> = entries.into_iter().take_while(|e| e.index <= last).collect();
        let contiguous = kept.iter().enumerate().all(|(i, e)| e.index == i as u64);
        if kept.len() as u64 != last + 1 || !contiguous {
            return Err(StitchError::checkpoint(
                dir.display().to_string(),
                format!("output holds {} frames, checkpoint needs frames 0..={last}", kept.len()),
            )
            .escalate("output and checkpoint disagree"));
        }

        // The shortened index is durable before any frame bytes go, so a crash at any
        // point leaves an output this checkpoint can resume again.
        let index_path = dir.join(INDEX_FILE);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StitchError::io_at("create index", &dir, e))?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            for entry in &kept {
                let line = serde_json::to_string(entry)?;
                writeln!(out, "{line}").map_err(|e| StitchError::io_at("write index", &index_path, e))?;
            }
            out.flush().map_err(|e| StitchError::io_at("write index", &index_path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| StitchError::io_at("sync index", tmp.path(), e))?;
        let index = tmp
            .persist(&index_path)
            .map_err(|e| StitchError::io_at("persist index", &index_path, e.error))?;
        let mut index = BufWriter::new(index);
        index
            .seek(SeekFrom::End(0))
            .map_err(|e| StitchError::io_at("seek index", &index_path, e))?;

        let offset = kept.last().map_or(0, |e| e.offset + e.len);
        let frames_path = dir.join(FRAMES_FILE);
        let frames = OpenOptions::new()
            .write(true)
            .open(&frames_path)
            .map_err(|e| StitchError::io_at("open frames", &frames_path, e))?;
        frames
            .set_len(offset)
            .and_then(|_| frames.sync_all())
            .map_err(|e| StitchError::io_at("truncate frames", &frames_path, e))?;
        let mut frames = BufWriter::new(frames);
        frames
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StitchError::io_at("seek frames", &frames_path, e))?;

        let last_resolution = kept
            .last()
            .map_or(Resolution::new(0, 0), |e| Resolution::new(e.width, e.height));
        info!(dir = %dir.display(), last, offset, "raw panorama output resumed");
        Ok(Self {
            dir,
            frames,
            index,
            offset,
            last_resolution,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads `index.jsonl` from an output directory. A missing file reads as empty.
    pub fn read_index(dir: impl AsRef<Path>) -> StitchResult<Vec<IndexEntry>> {
        let path = dir.as_ref().join(INDEX_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StitchError::io_at("open index", &path, e)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StitchError::io_at("read index", &path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash ends the usable index.
            match serde_json::from_str::<IndexEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }
        Ok(entries)
    }

    /// Pixels of one indexed frame.
    pub fn read_frame(dir: impl AsRef<Path>, entry: &IndexEntry) -> StitchResult<Vec<u8>> {
        let path = dir.as_ref().join(FRAMES_FILE);
        let data = fs::read(&path).map_err(|e| StitchError::io_at("read frames", &path, e))?;
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            StitchError::validation("index", "entry lies within frames file", format!("{start}..{end}"))
        })
    }

    fn append_entry(&mut self, entry: &IndexEntry) -> StitchResult<()> {
        let path = self.dir.join(INDEX_FILE);
        write_entry(&mut self.index, entry, &path)
    }
}

fn open_truncated(path: &Path) -> StitchResult<File> {
    File::create(path).map_err(|e| StitchError::io_at("create", path, e))
}

fn write_entry(out: &mut BufWriter<File>, entry: &IndexEntry, path: &Path) -> StitchResult<()> {
    let line = serde_json::to_string(entry)?;
    writeln!(out, "{line}").map_err(|e| StitchError::io_at("write index", path, e))
}

impl EncoderSink for RawFileSink {
    fn encode(&mut self, picture: &Picture<'_>) -> StitchResult<()> {
        let path = self.dir.join(FRAMES_FILE);
        self.frames
            .write_all(picture.pixels)
            .map_err(|e| StitchError::io_at("write frames", &path, e))?;
        let entry = IndexEntry {
            index: picture.tag.index,
            timestamp_ns: picture.tag.timestamp_ns,
            offset: self.offset,
            len: picture.pixels.len() as u64,
            width: picture.resolution.width,
            height: picture.resolution.height,
            missing: None,
            degraded: picture.flags.degraded.clone(),
        };
        self.offset += entry.len;
        self.last_resolution = picture.resolution;
        self.append_entry(&entry)
    }

    fn mark_missing(&mut self, tag: &FrameTag, reason: MissingReason) -> StitchResult<()> {
        let entry = IndexEntry {
            index: tag.index,
            timestamp_ns: tag.timestamp_ns,
            offset: self.offset,
            len: 0,
            width: self.last_resolution.width,
            height: self.last_resolution.height,
            missing: Some(reason),
            degraded: Vec::new(),
        };
        self.append_entry(&entry)
    }

    fn sync(&mut self) -> StitchResult<()> {
        let path = self.dir.join(FRAMES_FILE);
        let io = |e| StitchError::io_at("sync output", &path, e);
        self.frames.flush().map_err(io)?;
        self.index.flush().map_err(io)?;
        self.frames.get_ref().sync_data().map_err(io)?;
        self.index.get_ref().sync_data().map_err(io)?;
        Ok(())
    }

    fn finish(&mut self) -> StitchResult<()> {
        self.sync()
    }
}
