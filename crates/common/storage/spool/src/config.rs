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

use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub base_path:         PathBuf,
    /// Rotation threshold of a segment file in bytes.
    pub segment_size:      u64,
    /// Maximum number of events held in memory (unserved plus unacked).
    pub max_events:        usize,
    /// Maximum payload bytes held in memory. A single event larger than this
    /// is still accepted into an empty spool.
    pub max_bytes:         u64,
    pub push_mode:         PushMode,
    pub flush_mode:        FlushMode,
    pub checkpoint_policy: CheckpointPolicy,
    /// How long shutdown keeps serving gets and acks while events are held.
    pub drain_timeout:     Duration,
    /// Upper bound on how long the broker sleeps between housekeeping passes.
    pub tick_interval:     Duration,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            base_path:         PathBuf::from("./spool_data"),
            segment_size:      64 * 1024 * 1024,
            max_events:        4096,
            max_bytes:         64 * 1024 * 1024,
            push_mode:         PushMode::Block,
            flush_mode:        FlushMode::Async,
            checkpoint_policy: CheckpointPolicy::EveryAdvance,
            drain_timeout:     Duration::ZERO,
            tick_interval:     Duration::from_millis(50),
        }
    }
}

/// What a push does when the in-memory buffer is at its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Park the producer until an ack frees space or its deadline passes.
    Block,
    /// Answer immediately with a capacity signal.
    Reject,
}

/// When appended frames are forced to stable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushMode {
    /// Leave it to the OS; flushed on rotation and shutdown.
    Async,
    /// fsync before the push is answered.
    Sync,
    /// fsync once `bytes` are pending or `interval` has passed.
    Batch { bytes: u64, interval: Duration },
}

impl FlushMode {
    pub(crate) fn should_flush(&self, pending_bytes: u64, since_last: Duration) -> bool {
        match self {
            Self::Async => false,
            Self::Sync => pending_bytes > 0,
            Self::Batch { bytes, interval } => {
                pending_bytes > 0 && (pending_bytes >= *bytes || since_last >= *interval)
            }
        }
    }
}

/// When an advanced read offset is written to the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    EveryAdvance,
    /// At most once per interval; a crash replays whatever was acked since.
    Interval(Duration),
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_async_never_flushes() {
        assert!(!FlushMode::Async.should_flush(1 << 30, Duration::from_secs(3600)));
    }

    #[test]
    fn test_sync_flushes_when_pending() {
        assert!(FlushMode::Sync.should_flush(1, Duration::ZERO));
        assert!(!FlushMode::Sync.should_flush(0, Duration::ZERO));
    }

    #[test_case(999, 0, false ; "below both thresholds")]
    #[test_case(1000, 0, true ; "byte threshold reached")]
    #[test_case(1, 60, true ; "interval elapsed")]
    #[test_case(0, 60, false ; "nothing pending")]
    fn test_batch_flush(pending: u64, elapsed_secs: u64, expected: bool) {
        let mode = FlushMode::Batch {
            bytes:    1000,
            interval: Duration::from_secs(60),
        };
        assert_eq!(
            mode.should_flush(pending, Duration::from_secs(elapsed_secs)),
            expected
        );
    }
}
