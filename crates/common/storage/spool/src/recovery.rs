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

//! Crash recovery for the spool.
//!
//! 1. Load the checkpoint (absent on a fresh directory)
//! 2. Delete segments the checkpoint has already moved past
//! 3. Scan the remaining segments, cutting each at its first corrupt or
//!    incomplete frame
//! 4. Hand every frame at or after the checkpoint's read position back to
//!    the broker for redelivery

use std::{collections::BTreeMap, fs::OpenOptions, path::Path};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    Result, SpoolConfig, SpoolError,
    checkpoint::{Checkpoint, CheckpointStore, Position},
    path::{scan_segments, segment_dir},
    segment::{SealedSegment, SegmentReader, SegmentStore},
};

/// A segment cut short because of a damaged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationNote {
    pub segment:       u64,
    /// Offset the segment was truncated at.
    pub offset:        u64,
    /// Bytes discarded past the last valid frame.
    pub dropped_bytes: u64,
    pub reason:        String,
}

/// What recovery found and repaired on startup.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub checkpoint_found:   bool,
    /// Set when the checkpoint could not be decoded and replay restarted at
    /// the oldest segment.
    pub checkpoint_reset:   Option<String>,
    /// Events handed back for redelivery.
    pub replayed:           usize,
    pub reclaimed_segments: usize,
    pub truncations:        Vec<TruncationNote>,
    /// `(expected, found)` pairs where replayed sequences skip ahead.
    pub sequence_gaps:      Vec<(u64, u64)>,
    pub next_sequence:      u64,
}

/// An unacknowledged event read back from disk.
#[derive(Debug, Clone)]
pub(crate) struct ReplayEntry {
    pub sequence: u64,
    pub event:    Bytes,
    pub position: Position,
}

pub(crate) struct Recovered {
    pub store:            SegmentStore,
    pub checkpoint_store: CheckpointStore,
    pub replay:           Vec<ReplayEntry>,
    pub report:           RecoveryReport,
}

/// Rebuilds the segment store and the unacknowledged backlog.
pub(crate) fn recover(config: &SpoolConfig) -> Result<Recovered> {
    info!(path = ?config.base_path, "Starting spool recovery");
    std::fs::create_dir_all(segment_dir(&config.base_path))?;

    let mut report = RecoveryReport::default();
    let segments = scan_segments(&config.base_path)?;

    let checkpoint = match CheckpointStore::load(&config.base_path) {
        Ok(Some(checkpoint)) => {
            report.checkpoint_found = true;
            checkpoint
        }
        Ok(None) => {
            info!("No checkpoint found, replaying from the oldest segment");
            Checkpoint::default()
        }
        Err(SpoolError::CheckpointCorrupted { reason, .. }) => {
            warn!(%reason, "Checkpoint unreadable, replaying from the oldest segment");
            report.checkpoint_reset = Some(reason);
            Checkpoint::default()
        }
        Err(e) => return Err(e),
    };

    let mut live = Vec::with_capacity(segments.len());
    for (id, path) in segments {
        if id < checkpoint.read.segment {
            std::fs::remove_file(&path)?;
            report.reclaimed_segments += 1;
            debug!(segment = id, "Removed fully acknowledged segment");
        } else {
            live.push((id, path));
        }
    }

    let mut replay = Vec::new();
    let mut sealed = BTreeMap::new();
    let mut last_sequence: Option<u64> = None;
    let mut active = None;
    let live_count = live.len();

    for (index, (id, path)) in live.into_iter().enumerate() {
        let scan = {
            let reader = SegmentReader::open(&path)?;
            reader.scan(0)?
        };

        if let Some(stop) = &scan.stop {
            let dropped_bytes = scan.file_size - scan.valid_end;
            warn!(
                segment = id,
                offset = stop.offset(),
                dropped_bytes,
                reason = %stop,
                "Truncating segment at damaged frame, data past this point is lost"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_end)?;
            file.sync_all()?;
            report.truncations.push(TruncationNote {
                segment: id,
                offset: scan.valid_end,
                dropped_bytes,
                reason: stop.to_string(),
            });
        }

        for (offset, frame) in scan.frames {
            last_sequence = Some(last_sequence.map_or(frame.sequence, |s| s.max(frame.sequence)));
            let position = Position::new(id, offset);
            if position < checkpoint.read {
                continue;
            }
            if let Some(prev) = replay.last().map(|e: &ReplayEntry| e.sequence)
                && frame.sequence != prev + 1
            {
                warn!(
                    expected = prev + 1,
                    found = frame.sequence,
                    "Sequence gap in replayed frames"
                );
                report.sequence_gaps.push((prev + 1, frame.sequence));
            }
            replay.push(ReplayEntry {
                sequence: frame.sequence,
                event: frame.event,
                position,
            });
        }

        if index + 1 == live_count {
            active = Some((id, path, scan.valid_end));
        } else {
            sealed.insert(
                id,
                SealedSegment {
                    path,
                    size: scan.valid_end,
                },
            );
        }
    }

    // New frames must land after the read position, otherwise the next
    // recovery would skip them as already acknowledged.
    let (active_id, active_size) = match active {
        Some((id, _, size)) if Position::new(id, size) >= checkpoint.read => (id, size),
        Some((id, path, size)) => {
            warn!(
                read = %checkpoint.read,
                end = %Position::new(id, size),
                "Checkpoint points past the recovered end of the log, starting a new segment"
            );
            sealed.insert(id, SealedSegment { path, size });
            (id.max(checkpoint.read.segment) + 1, 0)
        }
        None => {
            let id = checkpoint.write.segment.max(checkpoint.read.segment);
            if checkpoint.read.offset > 0 || checkpoint.write.offset > 0 {
                (id + 1, 0)
            } else {
                (id, 0)
            }
        }
    };

    report.replayed = replay.len();
    report.next_sequence = last_sequence
        .map_or(checkpoint.next_sequence, |s| checkpoint.next_sequence.max(s + 1));

    let store = SegmentStore::open(
        &config.base_path,
        config.segment_size,
        config.flush_mode.clone(),
        active_id,
        active_size,
        sealed,
    )?;
    let checkpoint_store =
        CheckpointStore::new(&config.base_path, config.checkpoint_policy, checkpoint);

    info!(
        replayed = report.replayed,
        next_sequence = report.next_sequence,
        truncations = report.truncations.len(),
        reclaimed = report.reclaimed_segments,
        "Spool recovery complete"
    );

    Ok(Recovered {
        store,
        checkpoint_store,
        replay,
        report,
    })
}

/// Summary of one segment for offline inspection.
#[derive(Debug, Clone)]
pub struct SegmentSummary {
    pub id:             u64,
    pub size:           u64,
    pub frames:         usize,
    pub first_sequence: Option<u64>,
    pub last_sequence:  Option<u64>,
    /// Why the scan stopped early, if it did.
    pub damage:         Option<String>,
}

/// Read-only view of a spool directory.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub checkpoint: std::result::Result<Option<Checkpoint>, String>,
    pub segments:   Vec<SegmentSummary>,
}

impl Inspection {
    /// Frames in segments at or after the checkpoint's read segment.
    #[must_use]
    pub fn unacknowledged(&self) -> usize {
        let read = match &self.checkpoint {
            Ok(Some(cp)) => cp.read,
            _ => Position::default(),
        };
        self.segments
            .iter()
            .filter(|s| s.id >= read.segment)
            .map(|s| s.frames)
            .sum()
    }
}

/// Scans a spool directory without modifying it.
pub fn inspect<P: AsRef<Path>>(base_path: P) -> Result<Inspection> {
    let checkpoint = CheckpointStore::load(&base_path).map_err(|e| e.to_string());

    let mut segments = Vec::new();
    for (id, path) in scan_segments(&base_path)? {
        let reader = SegmentReader::open(&path)?;
        let scan = reader.scan(0)?;
        segments.push(SegmentSummary {
            id,
            size: reader.size(),
            frames: scan.frames.len(),
            first_sequence: scan.frames.first().map(|(_, f)| f.sequence),
            last_sequence: scan.frames.last().map(|(_, f)| f.sequence),
            damage: scan.stop.map(|s| s.to_string()),
        });
    }

    Ok(Inspection {
        checkpoint,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        CheckpointPolicy, FlushMode,
        checkpoint::CHECKPOINT_VERSION,
        frame::{encode_frame, frame_disk_size},
        path::{checkpoint_path, segment_file_path},
    };

    fn test_config(base_path: PathBuf) -> SpoolConfig {
        SpoolConfig {
            base_path,
            segment_size: 1024 * 1024,
            flush_mode: FlushMode::Sync,
            checkpoint_policy: CheckpointPolicy::EveryAdvance,
            ..SpoolConfig::default()
        }
    }

    struct TestFixture {
        _temp_dir: TempDir,
        config:    SpoolConfig,
    }

    impl TestFixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = test_config(temp_dir.path().to_path_buf());
            std::fs::create_dir_all(segment_dir(&config.base_path)).unwrap();
            Self {
                _temp_dir: temp_dir,
                config,
            }
        }

        fn write_segment(&self, id: u64, sequences: std::ops::Range<u64>) -> u64 {
            let mut file = std::fs::File::create(segment_file_path(&self.config.base_path, id))
                .unwrap();
            let mut size = 0;
            for seq in sequences {
                let frame = encode_frame(seq, format!("msg-{seq}").as_bytes()).unwrap();
                file.write_all(&frame).unwrap();
                size += frame.len() as u64;
            }
            size
        }

        fn append_raw(&self, id: u64, bytes: &[u8]) {
            let mut file = OpenOptions::new()
                .append(true)
                .open(segment_file_path(&self.config.base_path, id))
                .unwrap();
            file.write_all(bytes).unwrap();
        }

        fn write_checkpoint(&self, checkpoint: Checkpoint) {
            let mut store = CheckpointStore::new(
                &self.config.base_path,
                CheckpointPolicy::EveryAdvance,
                Checkpoint::default(),
            );
            store.update(checkpoint).unwrap();
        }
    }

    #[test]
    fn test_recovery_empty_directory() {
        let fixture = TestFixture::new();
        let recovered = recover(&fixture.config).unwrap();

        assert!(recovered.replay.is_empty());
        assert!(!recovered.report.checkpoint_found);
        assert_eq!(recovered.report.next_sequence, 0);
        assert_eq!(recovered.store.write_position(), Position::new(0, 0));
    }

    #[test]
    fn test_recovery_without_checkpoint_replays_everything() {
        let fixture = TestFixture::new();
        let size = fixture.write_segment(0, 0..10);

        let recovered = recover(&fixture.config).unwrap();
        assert_eq!(recovered.replay.len(), 10);
        assert_eq!(recovered.replay[0].sequence, 0);
        assert_eq!(recovered.report.next_sequence, 10);
        assert_eq!(recovered.store.write_position(), Position::new(0, size));
    }

    #[test]
    fn test_recovery_resumes_at_checkpoint() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 0..5);
        fixture.write_segment(1, 5..10);
        let frame = frame_disk_size("msg-5".len());
        fixture.write_checkpoint(Checkpoint {
            version:       CHECKPOINT_VERSION,
            read:          Position::new(1, 2 * frame),
            write:         Position::new(1, 5 * frame),
            next_sequence: 10,
        });

        let recovered = recover(&fixture.config).unwrap();
        let sequences: Vec<u64> = recovered.replay.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![7, 8, 9]);
        assert_eq!(recovered.report.reclaimed_segments, 1);
        assert!(!segment_file_path(&fixture.config.base_path, 0).exists());
        assert_eq!(recovered.report.next_sequence, 10);
    }

    #[test]
    fn test_recovery_truncates_corrupt_tail() {
        let fixture = TestFixture::new();
        let valid = fixture.write_segment(0, 0..1);
        let mut bad = encode_frame(1, b"corrupted").unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        fixture.append_raw(0, &bad);

        let recovered = recover(&fixture.config).unwrap();
        assert_eq!(recovered.replay.len(), 1);
        assert_eq!(&recovered.replay[0].event[..], b"msg-0");
        assert_eq!(recovered.report.truncations.len(), 1);
        let note = &recovered.report.truncations[0];
        assert_eq!(note.offset, valid);
        assert_eq!(note.dropped_bytes, bad.len() as u64);

        let on_disk = std::fs::metadata(segment_file_path(&fixture.config.base_path, 0))
            .unwrap()
            .len();
        assert_eq!(on_disk, valid);
        assert_eq!(recovered.store.write_position(), Position::new(0, valid));
    }

    #[test]
    fn test_recovery_truncates_partial_frame() {
        let fixture = TestFixture::new();
        let valid = fixture.write_segment(0, 0..3);
        let partial = encode_frame(3, b"torn write").unwrap();
        fixture.append_raw(0, &partial[..partial.len() / 2]);

        let recovered = recover(&fixture.config).unwrap();
        assert_eq!(recovered.replay.len(), 3);
        assert_eq!(recovered.report.truncations[0].offset, valid);
        assert_eq!(recovered.report.next_sequence, 3);
    }

    #[test]
    fn test_recovery_keeps_sequence_after_full_ack() {
        let fixture = TestFixture::new();
        let size = fixture.write_segment(0, 0..4);
        fixture.write_checkpoint(Checkpoint {
            version:       CHECKPOINT_VERSION,
            read:          Position::new(0, size),
            write:         Position::new(0, size),
            next_sequence: 4,
        });

        let recovered = recover(&fixture.config).unwrap();
        assert!(recovered.replay.is_empty());
        assert_eq!(recovered.report.next_sequence, 4);
    }

    #[test]
    fn test_recovery_with_corrupt_checkpoint_replays_all() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 0..3);
        std::fs::write(checkpoint_path(&fixture.config.base_path), b"garbage").unwrap();

        let recovered = recover(&fixture.config).unwrap();
        assert!(recovered.report.checkpoint_reset.is_some());
        assert_eq!(recovered.replay.len(), 3);
    }

    #[test]
    fn test_recovery_logs_sequence_gap() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 0..2);
        fixture.write_segment(1, 5..6);

        let recovered = recover(&fixture.config).unwrap();
        assert_eq!(recovered.report.sequence_gaps, vec![(2, 5)]);
        assert_eq!(recovered.report.next_sequence, 6);
    }

    #[test]
    fn test_recovery_starts_new_segment_when_checkpoint_is_ahead() {
        let fixture = TestFixture::new();
        let size = fixture.write_segment(0, 0..2);
        fixture.write_checkpoint(Checkpoint {
            version:       CHECKPOINT_VERSION,
            read:          Position::new(0, size + 512),
            write:         Position::new(0, size + 512),
            next_sequence: 9,
        });

        let recovered = recover(&fixture.config).unwrap();
        assert!(recovered.replay.is_empty());
        assert_eq!(recovered.store.write_position(), Position::new(1, 0));
        assert_eq!(recovered.store.sealed_count(), 1);
        assert_eq!(recovered.report.next_sequence, 9);
    }

    #[test]
    fn test_inspect_is_read_only() {
        let fixture = TestFixture::new();
        fixture.write_segment(0, 0..3);
        fixture.append_raw(0, &[0xAB; 9]);

        let inspection = inspect(&fixture.config.base_path).unwrap();
        assert!(matches!(inspection.checkpoint, Ok(None)));
        assert_eq!(inspection.segments.len(), 1);
        assert_eq!(inspection.segments[0].frames, 3);
        assert_eq!(inspection.segments[0].first_sequence, Some(0));
        assert_eq!(inspection.segments[0].last_sequence, Some(2));
        assert!(inspection.segments[0].damage.is_some());
        assert_eq!(inspection.unacknowledged(), 3);

        let again = inspect(&fixture.config.base_path).unwrap();
        assert!(again.segments[0].damage.is_some());
    }
}
