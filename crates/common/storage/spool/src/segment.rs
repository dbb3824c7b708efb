// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segment files: the append side owned by the broker, and a read-only
//! memory-mapped view used by recovery and inspection.
//!
//! ```text
//! ┌──────────────┐   append    ┌─────────────────────┐   rotate    ┌──────────────┐
//! │    Broker    │ ──────────► │ active segment (N)  │ ──────────► │ segment N+1  │
//! │ (owner thr.) │             └─────────────────────┘             └──────────────┘
//! └──────────────┘    reclaim: sealed segments below the checkpoint's read segment
//! ```

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use mmap_io::MemoryMappedFile;
use tracing::{debug, error, info, warn};

use crate::{
    FlushMode, Result,
    checkpoint::Position,
    error::{InternalSnafu, PausedSnafu},
    frame::{DecodedFrame, FrameRead, decode_frame, encode_frame},
    path::{segment_dir, segment_file_path},
};

/// A sealed segment retained until the read offset moves past it.
#[derive(Debug, Clone)]
pub(crate) struct SealedSegment {
    pub path: PathBuf,
    pub size: u64,
}

struct ActiveSegment {
    id:   u64,
    path: PathBuf,
    file: File,
    /// Bytes of complete frames in the file.
    size: u64,
}

/// Append-only segment log.
///
/// File handles are owned here and only touched from the broker thread.
pub(crate) struct SegmentStore {
    base_path:     PathBuf,
    segment_size:  u64,
    flush_mode:    FlushMode,
    active:        ActiveSegment,
    sealed:        BTreeMap<u64, SealedSegment>,
    /// Bytes appended since the last fsync.
    pending_bytes: u64,
    last_flush:    Instant,
    /// Set after a failed write until [`recover`](Self::recover) succeeds.
    poisoned:      Option<String>,
    #[cfg(test)]
    fail_appends:  u32,
}

impl SegmentStore {
    /// Opens the store with `active_id` as the append target.
    ///
    /// The active file is created if missing and cut back to `active_size`,
    /// which recovery has already validated.
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        segment_size: u64,
        flush_mode: FlushMode,
        active_id: u64,
        active_size: u64,
        sealed: BTreeMap<u64, SealedSegment>,
    ) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(segment_dir(&base_path))?;

        let active = open_active(&base_path, active_id, active_size)?;
        info!(
            segment = active_id,
            size = active_size,
            sealed = sealed.len(),
            "Segment store opened"
        );

        Ok(Self {
            base_path,
            segment_size,
            flush_mode,
            active,
            sealed,
            pending_bytes: 0,
            last_flush: Instant::now(),
            poisoned: None,
            #[cfg(test)]
            fail_appends: 0,
        })
    }

    /// Position the next frame will be written at.
    pub const fn write_position(&self) -> Position { Position::new(self.active.id, self.active.size) }

    pub fn is_poisoned(&self) -> bool { self.poisoned.is_some() }

    pub fn sealed_count(&self) -> usize { self.sealed.len() }

    /// Appends one event frame and returns the position it starts at.
    ///
    /// A poisoned store refuses appends until [`recover`](Self::recover)
    /// succeeds. A failed write poisons the store.
    pub fn append(&mut self, sequence: u64, event: &[u8]) -> Result<Position> {
        if let Some(reason) = &self.poisoned {
            return PausedSnafu {
                reason: reason.clone(),
            }
            .fail();
        }

        let frame = encode_frame(sequence, event)?;
        let frame_len = frame.len() as u64;

        if self.active.size > 0 && self.active.size + frame_len > self.segment_size {
            self.rotate()?;
        }

        let pos = self.write_position();
        if let Err(e) = self.write_frame(&frame) {
            error!(error = ?e, segment = pos.segment, offset = pos.offset, "Segment write failed");
            self.poisoned = Some(e.to_string());
            return Err(e);
        }

        self.active.size += frame_len;
        self.pending_bytes += frame_len;

        let flushed = if matches!(self.flush_mode, FlushMode::Sync) {
            self.flush()
        } else {
            self.maybe_flush()
        };
        if let Err(e) = flushed {
            // The frame is not acknowledged, so recovery must cut it off.
            self.active.size -= frame_len;
            return Err(e);
        }

        debug!(sequence, segment = pos.segment, offset = pos.offset, size = frame_len, "Appended frame");
        Ok(pos)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.fail_appends > 0 {
            self.fail_appends -= 1;
            return Err(std::io::Error::other("injected write failure").into());
        }
        self.active.file.write_all(frame)?;
        Ok(())
    }

    /// Seals the active segment and starts the next one.
    fn rotate(&mut self) -> Result<()> {
        self.flush()?;

        let next_id = self.active.id + 1;
        let next = open_active(&self.base_path, next_id, 0)?;
        let sealed = std::mem::replace(&mut self.active, next);
        info!(
            sealed = sealed.id,
            size = sealed.size,
            next = next_id,
            "Rotated to new segment"
        );
        self.sealed.insert(
            sealed.id,
            SealedSegment {
                path: sealed.path,
                size: sealed.size,
            },
        );
        Ok(())
    }

    /// Forces appended frames to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending_bytes == 0 {
            return Ok(());
        }
        if let Err(e) = self.active.file.sync_data() {
            self.poisoned = Some(e.to_string());
            return Err(e.into());
        }
        self.pending_bytes = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flushes when the configured flush mode says a flush is due.
    pub fn maybe_flush(&mut self) -> Result<()> {
        if self
            .flush_mode
            .should_flush(self.pending_bytes, self.last_flush.elapsed())
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Time until a batch-mode flush becomes due, if data is pending.
    pub fn flush_due_in(&self) -> Option<Duration> {
        match &self.flush_mode {
            FlushMode::Batch { interval, .. } if self.pending_bytes > 0 && self.poisoned.is_none() => {
                Some(interval.saturating_sub(self.last_flush.elapsed()))
            }
            _ => None,
        }
    }

    /// Cuts the active file back to its last complete frame and clears the
    /// poisoned state.
    pub fn recover(&mut self) -> Result<()> {
        if self.poisoned.is_none() {
            return Ok(());
        }
        let file = &self.active.file;
        file.set_len(self.active.size)?;
        file.sync_all()?;
        info!(
            segment = self.active.id,
            size = self.active.size,
            "Segment store recovered from write failure"
        );
        self.poisoned = None;
        self.pending_bytes = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Deletes sealed segments with an id below `read_segment`.
    ///
    /// Returns the number of segments removed.
    pub fn reclaim(&mut self, read_segment: u64) -> Result<usize> {
        let keep = self.sealed.split_off(&read_segment);
        let doomed = std::mem::replace(&mut self.sealed, keep);
        let count = doomed.len();
        for (id, segment) in doomed {
            match std::fs::remove_file(&segment.path) {
                Ok(()) => debug!(segment = id, size = segment.size, "Reclaimed segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(segment = id, "Segment already gone during reclaim");
                }
                Err(e) => {
                    self.sealed.insert(id, segment);
                    return Err(e.into());
                }
            }
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn inject_write_failures(&mut self, count: u32) { self.fail_appends = count; }
}

impl Drop for SegmentStore {
    fn drop(&mut self) {
        if self.pending_bytes > 0
            && self.poisoned.is_none()
            && let Err(e) = self.active.file.sync_data()
        {
            error!(error = ?e, segment = self.active.id, "Failed to sync segment on drop");
        }
    }
}

fn open_active(base_path: &Path, id: u64, size: u64) -> Result<ActiveSegment> {
    let path = segment_file_path(base_path, id);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let on_disk = file.metadata()?.len();
    if on_disk < size {
        return InternalSnafu {
            message: format!(
                "segment {} is {on_disk} bytes, expected at least {size}",
                path.display()
            ),
        }
        .fail();
    }
    if on_disk > size {
        file.set_len(size)?;
        file.sync_all()?;
    }
    Ok(ActiveSegment {
        id,
        path,
        file,
        size,
    })
}

/// Why a segment scan stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    Incomplete { offset: u64, available: u64 },
    Corrupt { offset: u64, reason: String },
}

impl ScanStop {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Incomplete { offset, .. } | Self::Corrupt { offset, .. } => *offset,
        }
    }
}

impl std::fmt::Display for ScanStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incomplete { offset, available } => {
                write!(f, "incomplete frame at offset {offset} ({available} bytes left)")
            }
            Self::Corrupt { offset, reason } => write!(f, "corrupt frame at offset {offset}: {reason}"),
        }
    }
}

/// Frames found by a segment scan.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// `(offset, frame)` pairs in file order.
    pub frames:    Vec<(u64, DecodedFrame)>,
    /// End of the last valid frame.
    pub valid_end: u64,
    pub file_size: u64,
    pub stop:      Option<ScanStop>,
}

/// Read-only memory-mapped segment.
pub struct SegmentReader {
    /// `None` for an empty file, which cannot be mapped.
    mmap: Option<MemoryMappedFile>,
    size: u64,
}

impl SegmentReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let size = std::fs::metadata(path.as_ref())?.len();
        if size == 0 {
            return Ok(Self { mmap: None, size });
        }
        let mmap = MemoryMappedFile::open_ro(path.as_ref()).map_err(|e| {
            InternalSnafu {
                message: format!("mmap of {} failed: {e}", path.as_ref().display()),
            }
            .build()
        })?;
        let size = mmap.len();
        Ok(Self {
            mmap: Some(mmap),
            size,
        })
    }

    pub const fn size(&self) -> u64 { self.size }

    /// Decodes frames from `start` to the first invalid or missing frame.
    pub fn scan(&self, start: u64) -> Result<SegmentScan> {
        let mut scan = SegmentScan {
            valid_end: start.min(self.size),
            file_size: self.size,
            ..SegmentScan::default()
        };
        let Some(mmap) = &self.mmap else {
            return Ok(scan);
        };
        if start >= self.size {
            return Ok(scan);
        }

        let data = mmap.as_slice(start, self.size - start).map_err(|e| {
            InternalSnafu {
                message: format!("mmap read failed: {e}"),
            }
            .build()
        })?;

        let mut cursor = 0usize;
        loop {
            let offset = start + cursor as u64;
            match decode_frame(&data[cursor..]) {
                FrameRead::Frame(frame) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let len = frame.disk_len as usize;
                    cursor += len;
                    scan.valid_end = start + cursor as u64;
                    scan.frames.push((offset, frame));
                }
                FrameRead::End => break,
                FrameRead::Incomplete { available } => {
                    scan.stop = Some(ScanStop::Incomplete { offset, available });
                    break;
                }
                FrameRead::Corrupt { reason } => {
                    scan.stop = Some(ScanStop::Corrupt { offset, reason });
                    break;
                }
            }
        }
        Ok(scan)
    }
}
