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

//! Durable read/write offsets.
//!
//! ## Binary Format
//!
//! ```text
//! ┌───────────────────────┬─────────────────────────────────────┐
//! │ magic: [u8; 4]        │ "SPCK"                              │
//! │ version: u32          │ Format version, currently 1         │
//! │ read_segment: u64     │ Segment of the first unacked frame  │
//! │ read_offset: u64      │ Byte offset of that frame           │
//! │ write_segment: u64    │ Active segment when written         │
//! │ write_offset: u64     │ End of the active segment           │
//! │ next_sequence: u64    │ Next sequence number to assign      │
//! │ reserved: [u8; 4]     │                                     │
//! │ checksum: u32         │ CRC32 of the 52 bytes above         │
//! └───────────────────────┴─────────────────────────────────────┘
//! ```
//!
//! The file is replaced atomically: the new record goes to
//! `checkpoint.tmp`, is synced, then renamed over `checkpoint`.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crc32fast::Hasher;
use snafu::ensure;
use tracing::debug;

use crate::{
    CheckpointPolicy, Result,
    error::{CheckpointCorruptedSnafu, UnsupportedCheckpointVersionSnafu},
    path::{checkpoint_path, checkpoint_tmp_path},
};

/// Magic bytes identifying a checkpoint file: "SPCK"
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SPCK";

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Size of an encoded checkpoint in bytes.
pub const CHECKPOINT_SIZE: usize = 56;

const CHECKSUM_OFFSET: usize = CHECKPOINT_SIZE - 4;

/// A position in the segment log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub segment: u64,
    pub offset:  u64,
}

impl Position {
    #[must_use]
    pub const fn new(segment: u64, offset: u64) -> Self { Self { segment, offset } }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Persisted queue offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub version:       u32,
    /// Everything before this position has been acknowledged.
    pub read:          Position,
    /// End of the written log when the checkpoint was taken.
    pub write:         Position,
    pub next_sequence: u64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version:       CHECKPOINT_VERSION,
            read:          Position::default(),
            write:         Position::default(),
            next_sequence: 0,
        }
    }
}

impl Checkpoint {
    #[must_use]
    pub fn serialize(&self) -> [u8; CHECKPOINT_SIZE] {
        let mut buf = [0u8; CHECKPOINT_SIZE];
        buf[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.read.segment.to_le_bytes());
        buf[16..24].copy_from_slice(&self.read.offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.write.segment.to_le_bytes());
        buf[32..40].copy_from_slice(&self.write.offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.next_sequence.to_le_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Decodes a checkpoint, validating magic, version and checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == CHECKPOINT_SIZE,
            CheckpointCorruptedSnafu {
                reason: format!(
                    "expected {CHECKPOINT_SIZE} bytes, found {}",
                    data.len()
                ),
            }
        );

        let magic = &data[0..4];
        ensure!(
            magic == CHECKPOINT_MAGIC,
            CheckpointCorruptedSnafu {
                reason: format!("invalid magic: {magic:?}"),
            }
        );

        let stored = read_u32(data, CHECKSUM_OFFSET);
        let computed = {
            let mut hasher = Hasher::new();
            hasher.update(&data[..CHECKSUM_OFFSET]);
            hasher.finalize()
        };
        ensure!(
            stored == computed,
            CheckpointCorruptedSnafu {
                reason: format!("checksum mismatch: stored={stored:#x}, computed={computed:#x}"),
            }
        );

        let version = read_u32(data, 4);
        ensure!(
            version == CHECKPOINT_VERSION,
            UnsupportedCheckpointVersionSnafu { version }
        );

        Ok(Self {
            version,
            read: Position::new(read_u64(data, 8), read_u64(data, 16)),
            write: Position::new(read_u64(data, 24), read_u64(data, 32)),
            next_sequence: read_u64(data, 40),
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Owns the checkpoint file and decides when an update hits the disk.
pub(crate) struct CheckpointStore {
    base_path:  PathBuf,
    policy:     CheckpointPolicy,
    /// Last checkpoint handed to [`update`](Self::update).
    current:    Checkpoint,
    /// Last checkpoint known to be on disk.
    persisted:  Checkpoint,
    last_write: Instant,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(base_path: P, policy: CheckpointPolicy, initial: Checkpoint) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            policy,
            current: initial,
            persisted: initial,
            last_write: Instant::now(),
        }
    }

    /// Reads the checkpoint under `base_path`, `None` on a fresh directory.
    pub fn load<P: AsRef<Path>>(base_path: P) -> Result<Option<Checkpoint>> {
        let path = checkpoint_path(&base_path);
        if !path.exists() {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(CHECKPOINT_SIZE);
        File::open(&path)?.read_to_end(&mut data)?;
        Checkpoint::deserialize(&data).map(Some)
    }

    pub const fn persisted(&self) -> &Checkpoint { &self.persisted }

    /// Records a new checkpoint and writes it if the policy says so.
    ///
    /// Returns `true` when the checkpoint reached the disk.
    pub fn update(&mut self, checkpoint: Checkpoint) -> Result<bool> {
        self.current = checkpoint;
        if self.current == self.persisted {
            return Ok(false);
        }
        match self.policy {
            CheckpointPolicy::EveryAdvance => self.write_current().map(|()| true),
            CheckpointPolicy::Interval(interval) => self.write_if_due(interval),
        }
    }

    /// Writes a pending checkpoint once its interval has elapsed, or retries
    /// a failed write under [`CheckpointPolicy::EveryAdvance`].
    pub fn tick(&mut self) -> Result<bool> {
        match self.policy {
            CheckpointPolicy::EveryAdvance => self.flush(),
            CheckpointPolicy::Interval(interval) => self.write_if_due(interval),
        }
    }

    /// Writes any pending checkpoint regardless of policy.
    pub fn flush(&mut self) -> Result<bool> {
        if self.current == self.persisted {
            return Ok(false);
        }
        self.write_current().map(|()| true)
    }

    /// Time until a pending interval checkpoint is due.
    pub fn due_in(&self) -> Option<Duration> {
        match self.policy {
            CheckpointPolicy::Interval(interval) if self.current != self.persisted => {
                Some(interval.saturating_sub(self.last_write.elapsed()))
            }
            _ => None,
        }
    }

    fn write_if_due(&mut self, interval: Duration) -> Result<bool> {
        if self.current == self.persisted || self.last_write.elapsed() < interval {
            return Ok(false);
        }
        self.write_current().map(|()| true)
    }

    fn write_current(&mut self) -> Result<()> {
        // A failed attempt still waits a full interval before the next one.
        self.last_write = Instant::now();
        let tmp_path = checkpoint_tmp_path(&self.base_path);
        let final_path = checkpoint_path(&self.base_path);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&self.current.serialize())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.base_path)?;

        self.persisted = self.current;

        debug!(
            read = %self.persisted.read,
            write = %self.persisted.write,
            next_sequence = self.persisted.next_sequence,
            "Checkpoint written"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> { Ok(()) }

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            version:       CHECKPOINT_VERSION,
            read:          Position::new(3, 1024),
            write:         Position::new(5, 4096),
            next_sequence: 12345,
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let bytes = sample().serialize();
        assert_eq!(bytes.len(), CHECKPOINT_SIZE);
        assert_eq!(Checkpoint::deserialize(&bytes).unwrap(), sample());
    }

    fn corrupt_magic(bytes: &mut Vec<u8>) { bytes[0] = 0xFF; }

    fn corrupt_field(bytes: &mut Vec<u8>) { bytes[20] ^= 0xFF; }

    fn corrupt_checksum(bytes: &mut Vec<u8>) { bytes[CHECKSUM_OFFSET] ^= 0xFF; }

    fn truncate(bytes: &mut Vec<u8>) { bytes.truncate(10); }

    #[test_case(corrupt_magic ; "invalid magic")]
    #[test_case(corrupt_field ; "flipped offset byte")]
    #[test_case(corrupt_checksum ; "invalid checksum")]
    #[test_case(truncate ; "short file")]
    fn test_checkpoint_deserialize_corrupted(corrupt_fn: fn(&mut Vec<u8>)) {
        let mut bytes = sample().serialize().to_vec();
        corrupt_fn(&mut bytes);
        assert!(Checkpoint::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_checkpoint_rejects_future_version() {
        let cp = Checkpoint {
            version: CHECKPOINT_VERSION + 1,
            ..sample()
        };
        let err = Checkpoint::deserialize(&cp.serialize()).unwrap_err();
        assert!(matches!(
            err,
            crate::SpoolError::UnsupportedCheckpointVersion { version: 2, .. }
        ));
    }

    #[test]
    fn test_fresh_start_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(CheckpointStore::load(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_every_advance_persists_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(
            temp_dir.path(),
            CheckpointPolicy::EveryAdvance,
            Checkpoint::default(),
        );

        assert!(store.update(sample()).unwrap());
        assert!(!store.update(sample()).unwrap());
        assert_eq!(CheckpointStore::load(temp_dir.path()).unwrap(), Some(sample()));
        assert!(!checkpoint_tmp_path(temp_dir.path()).exists());
    }

    #[test]
    fn test_interval_policy_defers_until_flush() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(
            temp_dir.path(),
            CheckpointPolicy::Interval(Duration::from_secs(3600)),
            Checkpoint::default(),
        );

        assert!(!store.update(sample()).unwrap());
        assert!(!store.tick().unwrap());
        assert!(store.due_in().is_some());
        assert!(CheckpointStore::load(temp_dir.path()).unwrap().is_none());

        assert!(store.flush().unwrap());
        assert_eq!(store.persisted(), &sample());
        assert!(store.due_in().is_none());
        assert_eq!(CheckpointStore::load(temp_dir.path()).unwrap(), Some(sample()));
    }

    #[test]
    fn test_interval_policy_writes_when_due() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(
            temp_dir.path(),
            CheckpointPolicy::Interval(Duration::ZERO),
            Checkpoint::default(),
        );
        assert!(store.update(sample()).unwrap());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(
            temp_dir.path(),
            CheckpointPolicy::EveryAdvance,
            Checkpoint::default(),
        );
        store.update(sample()).unwrap();
        let later = Checkpoint {
            read: Position::new(5, 0),
            ..sample()
        };
        store.update(later).unwrap();

        assert_eq!(CheckpointStore::load(temp_dir.path()).unwrap(), Some(later));
    }
}
