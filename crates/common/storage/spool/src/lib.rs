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

//! Disk-backed event spool with at-least-once delivery.
//!
//! Producers push events, a consumer takes them in batches and acknowledges
//! them. Events live in append-only segment files until acknowledged; a
//! checkpoint records how far the consumer got so a restart replays only
//! what was never acknowledged.

mod batch;
mod broker;
pub mod builder;
pub mod checkpoint;
pub mod config;
mod consumer;
pub mod error;
pub mod frame;
pub mod path;
mod producer;
mod recovery;
mod request;
mod segment;
mod spool;

pub use batch::{AckHandle, AckStatus, Batch, BatchId, Event};
pub use broker::{QueueState, SpoolStats};
pub use builder::SpoolBuilder;
pub use checkpoint::{Checkpoint, Position};
pub use config::{CheckpointPolicy, FlushMode, PushMode, SpoolConfig};
pub use consumer::Consumer;
pub use error::{Result, SpoolError};
pub use producer::Producer;
pub use recovery::{Inspection, RecoveryReport, SegmentSummary, TruncationNote, inspect};
pub use request::ProducerId;
pub use segment::{ScanStop, SegmentReader, SegmentScan};
pub use spool::Spool;
