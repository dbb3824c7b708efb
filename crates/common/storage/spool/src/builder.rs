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

use crate::{CheckpointPolicy, FlushMode, PushMode, Result, Spool, SpoolConfig};

pub struct SpoolBuilder {
    config: SpoolConfig,
}

impl SpoolBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            config: SpoolConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn segment_size(mut self, size: u64) -> Self {
        self.config.segment_size = size;
        self
    }

    #[must_use]
    pub fn max_events(mut self, max: usize) -> Self {
        self.config.max_events = max;
        self
    }

    #[must_use]
    pub fn max_bytes(mut self, max: u64) -> Self {
        self.config.max_bytes = max;
        self
    }

    #[must_use]
    pub fn push_mode(mut self, mode: PushMode) -> Self {
        self.config.push_mode = mode;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.config.checkpoint_policy = policy;
        self
    }

    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Recovers any existing state under the base path and starts the broker.
    pub fn build(self) -> Result<Spool> { Spool::open(self.config) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default_config() {
        let builder = SpoolBuilder::new("/tmp/test_spool");
        assert_eq!(builder.config.base_path, PathBuf::from("/tmp/test_spool"));
        assert_eq!(builder.config.segment_size, 64 * 1024 * 1024);
        assert_eq!(builder.config.max_events, 4096);
        assert_eq!(builder.config.push_mode, PushMode::Block);
        assert_eq!(builder.config.flush_mode, FlushMode::Async);
        assert_eq!(
            builder.config.checkpoint_policy,
            CheckpointPolicy::EveryAdvance
        );
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = SpoolBuilder::new("/tmp/test_spool")
            .segment_size(4096)
            .max_events(3)
            .max_bytes(1024)
            .push_mode(PushMode::Reject)
            .flush_mode(FlushMode::Sync)
            .checkpoint_policy(CheckpointPolicy::Interval(Duration::from_secs(1)))
            .drain_timeout(Duration::from_secs(5))
            .tick_interval(Duration::from_millis(10));

        assert_eq!(builder.config.segment_size, 4096);
        assert_eq!(builder.config.max_events, 3);
        assert_eq!(builder.config.max_bytes, 1024);
        assert_eq!(builder.config.push_mode, PushMode::Reject);
        assert_eq!(builder.config.flush_mode, FlushMode::Sync);
        assert!(matches!(
            builder.config.checkpoint_policy,
            CheckpointPolicy::Interval(_)
        ));
        assert_eq!(builder.config.drain_timeout, Duration::from_secs(5));
        assert_eq!(builder.config.tick_interval, Duration::from_millis(10));
    }
}
