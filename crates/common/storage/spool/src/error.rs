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

use std::{io, path::PathBuf};

use snafu::{Location, Snafu};

/// Spool operation errors.
///
/// Capacity and empty-queue conditions are not errors: they surface as
/// `Ok(None)` from the push and get calls.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpoolError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error: {source}"), context(false))]
    Io {
        source: io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// The broker has shut down and accepts no further requests.
    #[snafu(display("Spool is closed"))]
    Closed {
        #[snafu(implicit)]
        loc: Location,
    },

    /// The producer was canceled; its pushes are refused from now on.
    #[snafu(display("Producer {producer} was canceled"))]
    ProducerCanceled {
        producer: usize,
        #[snafu(implicit)]
        loc:      Location,
    },

    /// A previous segment write failed and the store has not recovered yet.
    #[snafu(display("Spool is paused after a write failure: {reason}"))]
    Paused {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// The checkpoint file exists but cannot be decoded.
    #[snafu(display("Checkpoint corrupted: {reason}"))]
    CheckpointCorrupted {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// The checkpoint was written by an incompatible format version.
    #[snafu(display("Unsupported checkpoint version: {version}"))]
    UnsupportedCheckpointVersion {
        version: u32,
        #[snafu(implicit)]
        loc:     Location,
    },

    /// A path inside the spool directory does not follow the naming scheme.
    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath {
        path: PathBuf,
        #[snafu(implicit)]
        loc:  Location,
    },

    /// An event does not fit in a single frame.
    #[snafu(display("Event of {len} bytes exceeds the maximum frame size"))]
    FrameTooLarge {
        len: usize,
        #[snafu(implicit)]
        loc: Location,
    },

    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        #[snafu(implicit)]
        loc:     Location,
    },
}

impl SpoolError {
    /// Whether the caller may retry the same request shortly.
    ///
    /// `Paused` clears once the segment store recovers. Every other error
    /// means the caller should stop issuing requests.
    #[must_use]
    pub const fn is_retryable(&self) -> bool { matches!(self, Self::Paused { .. }) }

    /// Whether the error means the spool is gone for good.
    #[must_use]
    pub const fn is_closed(&self) -> bool { matches!(self, Self::Closed { .. }) }
}

/// Result type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let paused = PausedSnafu {
            reason: "disk full".to_string(),
        }
        .build();
        assert!(paused.is_retryable());
        assert!(!paused.is_closed());

        let closed = ClosedSnafu.build();
        assert!(!closed.is_retryable());
        assert!(closed.is_closed());

        let canceled = ProducerCanceledSnafu { producer: 3usize }.build();
        assert!(!canceled.is_retryable());
        assert_eq!(canceled.to_string(), "Producer 3 was canceled");
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            let res: io::Result<()> = Err(io::Error::other("boom"));
            res?;
            Ok(())
        }
        assert!(matches!(fails(), Err(SpoolError::Io { .. })));
    }
}
