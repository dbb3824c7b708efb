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

use bytes::Bytes;

use crate::{
    Result,
    request::{AckRequest, BatchCancelRequest, Requests, Served, call},
};

/// Identifier of a served batch, unique for the lifetime of a broker.
pub type BatchId = u64;

/// A single event as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub sequence: u64,
    pub payload:  Bytes,
}

/// Outcome of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The batch, and every outstanding batch below it, is acknowledged.
    Acked,
    /// Unknown, canceled or already acknowledged batch; nothing changed.
    Ignored,
}

/// A contiguous run of events handed to a consumer.
///
/// The events stay in the spool until the batch is acknowledged. Dropping a
/// batch without acking or canceling it leaves it outstanding.
#[derive(Debug)]
pub struct Batch {
    events: Vec<Event>,
    ack:    AckHandle,
}

impl Batch {
    pub(crate) fn new(served: Served, requests: Requests) -> Self {
        Self {
            events: served.events,
            ack:    AckHandle {
                batch: served.id,
                requests,
            },
        }
    }

    pub const fn id(&self) -> BatchId { self.ack.batch }

    pub fn events(&self) -> &[Event] { &self.events }

    pub fn into_events(self) -> Vec<Event> { self.events }

    pub fn len(&self) -> usize { self.events.len() }

    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    pub fn first_sequence(&self) -> Option<u64> { self.events.first().map(|e| e.sequence) }

    pub fn last_sequence(&self) -> Option<u64> { self.events.last().map(|e| e.sequence) }

    /// A handle that can acknowledge this batch from anywhere, any number of
    /// times.
    pub fn ack_handle(&self) -> AckHandle { self.ack.clone() }

    pub fn ack(&self) -> Result<AckStatus> { self.ack.ack() }

    pub fn cancel(&self) -> Result<usize> { self.ack.cancel() }
}

/// Acknowledges or returns one batch.
#[derive(Clone)]
pub struct AckHandle {
    batch:    BatchId,
    requests: Requests,
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").field("batch", &self.batch).finish()
    }
}

impl AckHandle {
    pub const fn batch_id(&self) -> BatchId { self.batch }

    /// Marks the batch, and every earlier outstanding batch, as processed.
    pub fn ack(&self) -> Result<AckStatus> {
        call(&self.requests.ack, |resp| AckRequest {
            batch: self.batch,
            resp,
        })
    }

    /// Returns the batch's events to the unserved pool for redelivery.
    ///
    /// Yields the number of events re-queued, `0` if the batch was already
    /// acknowledged or canceled.
    pub fn cancel(&self) -> Result<usize> {
        call(&self.requests.cancel_batch, |resp| BatchCancelRequest {
            batch: self.batch,
            resp,
        })
    }
}
