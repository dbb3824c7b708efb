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

use std::time::Duration;

use crate::{
    Result,
    batch::{AckStatus, Batch},
    error::ClosedSnafu,
    request::{Deadline, GetRequest, Requests, call},
};

/// Handle used by the output pipeline to drain the spool.
pub struct Consumer {
    requests: Requests,
}

impl Consumer {
    pub(crate) const fn new(requests: Requests) -> Self { Self { requests } }

    /// Waits for the oldest unserved run of up to `max_count` events.
    ///
    /// Fails with [`Closed`](crate::SpoolError::Closed) once the spool shuts
    /// down with nothing left to serve.
    pub fn get(&self, max_count: usize) -> Result<Batch> {
        match self.request(max_count, Deadline::Never)? {
            Some(batch) => Ok(batch),
            None => ClosedSnafu.fail(),
        }
    }

    /// Like [`get`](Self::get), but returns `None` when nothing arrives
    /// within `timeout`.
    pub fn get_timeout(&self, max_count: usize, timeout: Duration) -> Result<Option<Batch>> {
        self.request(max_count, Deadline::after(timeout))
    }

    /// Returns a batch only if events are waiting right now.
    pub fn try_get(&self, max_count: usize) -> Result<Option<Batch>> {
        self.request(max_count, Deadline::Immediate)
    }

    fn request(&self, max_count: usize, deadline: Deadline) -> Result<Option<Batch>> {
        let served = call(&self.requests.get, |resp| GetRequest {
            max_count,
            deadline,
            resp,
        })?;
        Ok(served.map(|served| Batch::new(served, self.requests.clone())))
    }

    pub fn ack(&self, batch: &Batch) -> Result<AckStatus> { batch.ack() }

    /// Returns a batch for redelivery. See [`AckHandle::cancel`](crate::AckHandle::cancel).
    pub fn cancel_batch(&self, batch: &Batch) -> Result<usize> { batch.cancel() }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}
