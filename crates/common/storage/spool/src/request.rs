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

//! Requests sent to the broker thread.
//!
//! Every request that expects an answer carries a `bounded(1)` reply sender.
//! The caller blocks on the matching receiver; the broker may hold on to the
//! sender (a parked push or get) and answer later. If the broker is gone the
//! sender is dropped and the caller sees [`SpoolError::Closed`].

use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use crate::{
    Result,
    batch::{AckStatus, BatchId, Event},
    broker::SpoolStats,
    error::ClosedSnafu,
};

/// Stable identifier of a producer's record inside the broker.
pub type ProducerId = usize;

/// How long a request may wait at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// Answer right away, never park.
    Immediate,
    At(Instant),
    Never,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Never, Self::At)
    }

    pub fn has_passed(self, now: Instant) -> bool {
        match self {
            Self::Immediate => true,
            Self::At(at) => at <= now,
            Self::Never => false,
        }
    }

    pub fn instant(self) -> Option<Instant> {
        match self {
            Self::At(at) => Some(at),
            Self::Immediate | Self::Never => None,
        }
    }
}

pub(crate) struct OpenProducer {
    pub resp: Sender<Result<ProducerId>>,
}

pub(crate) struct CloseProducer {
    pub producer: ProducerId,
}

pub(crate) struct PushRequest {
    pub producer: ProducerId,
    pub payload:  Bytes,
    pub deadline: Deadline,
    /// `Ok(None)` when no space became available in time.
    pub resp:     Sender<Result<Option<u64>>>,
}

pub(crate) struct ProducerCancelRequest {
    pub producer: ProducerId,
    pub resp:     Sender<Result<usize>>,
}

/// Events handed out by the broker; the consumer wraps them into a
/// [`Batch`](crate::Batch).
#[derive(Debug)]
pub(crate) struct Served {
    pub id:     BatchId,
    pub events: Vec<Event>,
}

pub(crate) struct GetRequest {
    pub max_count: usize,
    pub deadline:  Deadline,
    pub resp:      Sender<Result<Option<Served>>>,
}

pub(crate) struct AckRequest {
    pub batch: BatchId,
    pub resp:  Sender<Result<AckStatus>>,
}

pub(crate) struct BatchCancelRequest {
    pub batch: BatchId,
    pub resp:  Sender<Result<usize>>,
}

pub(crate) struct StatsRequest {
    pub resp: Sender<Result<SpoolStats>>,
}

pub(crate) struct ShutdownRequest {
    pub resp: Sender<Result<()>>,
}

/// Sending halves, shared by every handle.
#[derive(Clone)]
pub(crate) struct Requests {
    pub open:            Sender<OpenProducer>,
    pub close:           Sender<CloseProducer>,
    pub push:            Sender<PushRequest>,
    pub cancel_producer: Sender<ProducerCancelRequest>,
    pub get:             Sender<GetRequest>,
    pub ack:             Sender<AckRequest>,
    pub cancel_batch:    Sender<BatchCancelRequest>,
    pub stats:           Sender<StatsRequest>,
    pub shutdown:        Sender<ShutdownRequest>,
}

/// Receiving halves, owned by the broker thread.
pub(crate) struct Inbox {
    pub open:            Receiver<OpenProducer>,
    pub close:           Receiver<CloseProducer>,
    pub push:            Receiver<PushRequest>,
    pub cancel_producer: Receiver<ProducerCancelRequest>,
    pub get:             Receiver<GetRequest>,
    pub ack:             Receiver<AckRequest>,
    pub cancel_batch:    Receiver<BatchCancelRequest>,
    pub stats:           Receiver<StatsRequest>,
    pub shutdown:        Receiver<ShutdownRequest>,
}

pub(crate) fn channels() -> (Requests, Inbox) {
    let (open_tx, open_rx) = unbounded();
    let (close_tx, close_rx) = unbounded();
    let (push_tx, push_rx) = unbounded();
    let (cancel_producer_tx, cancel_producer_rx) = unbounded();
    let (get_tx, get_rx) = unbounded();
    let (ack_tx, ack_rx) = unbounded();
    let (cancel_batch_tx, cancel_batch_rx) = unbounded();
    let (stats_tx, stats_rx) = unbounded();
    let (shutdown_tx, shutdown_rx) = unbounded();

    (
        Requests {
            open:            open_tx,
            close:           close_tx,
            push:            push_tx,
            cancel_producer: cancel_producer_tx,
            get:             get_tx,
            ack:             ack_tx,
            cancel_batch:    cancel_batch_tx,
            stats:           stats_tx,
            shutdown:        shutdown_tx,
        },
        Inbox {
            open:            open_rx,
            close:           close_rx,
            push:            push_rx,
            cancel_producer: cancel_producer_rx,
            get:             get_rx,
            ack:             ack_rx,
            cancel_batch:    cancel_batch_rx,
            stats:           stats_rx,
            shutdown:        shutdown_rx,
        },
    )
}

/// Sends a request built around a fresh reply channel and waits for the
/// answer.
pub(crate) fn call<R, T>(tx: &Sender<R>, build: impl FnOnce(Sender<Result<T>>) -> R) -> Result<T> {
    let (resp, rx) = bounded(1);
    if tx.send(build(resp)).is_err() {
        return ClosedSnafu.fail();
    }
    match rx.recv() {
        Ok(answer) => answer,
        Err(_) => ClosedSnafu.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_has_passed() {
        let now = Instant::now();
        assert!(Deadline::Immediate.has_passed(now));
        assert!(!Deadline::Never.has_passed(now));
        assert!(Deadline::At(now).has_passed(now));
        assert!(!Deadline::At(now + Duration::from_secs(1)).has_passed(now));
    }

    #[test]
    fn test_call_reports_closed_when_broker_is_gone() {
        let (requests, inbox) = channels();
        drop(inbox);
        let err = call(&requests.stats, |resp| StatsRequest { resp }).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_call_reports_closed_when_reply_is_dropped() {
        let (requests, inbox) = channels();
        let handle = std::thread::spawn(move || {
            let req = inbox.shutdown.recv().unwrap();
            drop(req);
        });
        let err = call(&requests.shutdown, |resp| ShutdownRequest { resp }).unwrap_err();
        assert!(err.is_closed());
        handle.join().unwrap();
    }
}
