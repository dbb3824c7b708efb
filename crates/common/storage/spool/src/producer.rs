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

//! Producer side of the spool.
//!
//! ```ignore
//! let producer = spool.producer()?;
//! match producer.push(line)? {
//!     Some(seq) => debug!(seq, "queued"),
//!     None => { /* full in reject mode: back off */ }
//! }
//! ```

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::{
    Result,
    request::{
        CloseProducer, Deadline, OpenProducer, ProducerCancelRequest, ProducerId, PushRequest,
        Requests, call,
    },
};

/// Handle for one input feeding the spool.
///
/// Events pushed through one handle are served in push order. Dropping the
/// handle closes it; events it already pushed stay queued.
pub struct Producer {
    id:       ProducerId,
    requests: Requests,
}

impl Producer {
    pub(crate) fn open(requests: Requests) -> Result<Self> {
        let id = call(&requests.open, |resp| OpenProducer { resp })?;
        Ok(Self { id, requests })
    }

    pub const fn id(&self) -> ProducerId { self.id }

    /// Queues an event, waiting for space when the spool is full.
    ///
    /// Returns the assigned sequence number, or `None` if the spool refuses
    /// the event for lack of space (reject mode).
    pub fn push(&self, event: impl Into<Bytes>) -> Result<Option<u64>> {
        self.send(event.into(), Deadline::Never)
    }

    /// Like [`push`](Self::push), but gives up with `None` once `timeout`
    /// has passed without space becoming available.
    pub fn push_timeout(&self, event: impl Into<Bytes>, timeout: Duration) -> Result<Option<u64>> {
        self.send(event.into(), Deadline::after(timeout))
    }

    /// Queues an event only if there is space right now.
    pub fn try_push(&self, event: impl Into<Bytes>) -> Result<Option<u64>> {
        self.send(event.into(), Deadline::Immediate)
    }

    fn send(&self, payload: Bytes, deadline: Deadline) -> Result<Option<u64>> {
        call(&self.requests.push, |resp| PushRequest {
            producer: self.id,
            payload,
            deadline,
            resp,
        })
    }

    /// Drops every event of this producer that has not been served yet.
    ///
    /// Events already handed to a consumer are left alone. Pushes waiting
    /// for space, and every later push, fail with
    /// [`ProducerCanceled`](crate::SpoolError::ProducerCanceled).
    pub fn cancel(&self) -> Result<usize> {
        call(&self.requests.cancel_producer, |resp| ProducerCancelRequest {
            producer: self.id,
            resp,
        })
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").field("id", &self.id).finish()
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self
            .requests
            .close
            .send(CloseProducer { producer: self.id })
            .is_err()
        {
            debug!(producer = self.id, "Spool already closed when dropping producer");
        }
    }
}
