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

//! The broker: sole owner of the spool's state.
//!
//! ```text
//! ┌──────────┐  push / cancel           ┌──────────────────────────────┐
//! │ Producer │ ───────────────────────► │            Broker            │
//! └──────────┘                          │  pending ─► outstanding ─►   │
//! ┌──────────┐  get / ack / cancel      │  released (checkpoint moves) │
//! │ Consumer │ ───────────────────────► │                              │
//! └──────────┘                          └──────┬───────────────┬───────┘
//!                                              │ append        │ persist
//!                                              ▼               ▼
//!                                        SegmentStore    CheckpointStore
//! ```
//!
//! One request is handled at a time on the broker thread, so none of the
//! state below needs a lock. Requests that cannot be answered yet (a push
//! against a full spool, a get against an empty one) are parked together
//! with their reply sender and answered when the situation changes or their
//! deadline passes. Deadlines are only ever evaluated here.
//!
//! ## Acknowledgement
//!
//! Acks are cumulative: acking a batch also acks every outstanding batch
//! below it. Events leave memory from the front only, once acknowledged and
//! with nothing unresolved ahead of them. A batch put back with
//! [`cancel`](crate::AckHandle::cancel) therefore holds the durable read
//! offset until it is served and acked again.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam::channel::{Sender, select};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::{
    PushMode, Result, SpoolConfig,
    batch::{AckStatus, BatchId, Event},
    checkpoint::{CHECKPOINT_VERSION, Checkpoint, CheckpointStore, Position},
    error::{ClosedSnafu, InternalSnafu, ProducerCanceledSnafu},
    recovery::Recovered,
    request::{
        AckRequest, BatchCancelRequest, CloseProducer, GetRequest, Inbox, OpenProducer,
        ProducerCancelRequest, ProducerId, PushRequest, Served, StatsRequest,
    },
    segment::SegmentStore,
};

/// Lifecycle of the spool as seen by its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing held.
    Empty,
    Active,
    /// At the event or byte bound; pushes park or are refused.
    Full,
    /// Shutting down: no new events, held ones may still be served and acked.
    Draining,
    Closed,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Active => "active",
            Self::Full => "full",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolStats {
    pub state:               QueueState,
    /// Events waiting to be served.
    pub unserved:            usize,
    pub outstanding_batches: usize,
    /// Events served but not yet released.
    pub outstanding_events:  usize,
    pub held_bytes:          u64,
    pub next_sequence:       u64,
    /// Read position of the last checkpoint on disk.
    pub durable_read:        Position,
    /// A segment write failed and pushes are refused until it recovers.
    pub paused:              bool,
    pub producers:           usize,
    pub parked_pushes:       usize,
    pub parked_gets:         usize,
    pub sealed_segments:     usize,
}

struct Entry {
    sequence: u64,
    payload:  Bytes,
    /// `None` for events replayed from disk.
    producer: Option<ProducerId>,
    position: Position,
}

struct Outstanding {
    id:      BatchId,
    entries: Vec<Entry>,
    acked:   bool,
}

#[derive(Debug, Default)]
struct ProducerSlot {
    /// Accepted events of this producer not yet released.
    pending:  usize,
    canceled: bool,
    closed:   bool,
}

pub(crate) struct Broker {
    config:           Arc<SpoolConfig>,
    store:            SegmentStore,
    checkpoints:      CheckpointStore,
    /// Unserved events in sequence order.
    pending:          VecDeque<Entry>,
    /// Served batches keyed by their first sequence.
    outstanding:      BTreeMap<u64, Outstanding>,
    batches:          HashMap<BatchId, u64>,
    producers:        Slab<ProducerSlot>,
    parked_pushes:    VecDeque<PushRequest>,
    parked_gets:      VecDeque<GetRequest>,
    next_sequence:    u64,
    next_batch:       BatchId,
    held_events:      usize,
    held_bytes:       u64,
    state:            QueueState,
    drain_deadline:   Option<Instant>,
    shutdown_waiters: Vec<Sender<Result<()>>>,
    finalized:        bool,
}

fn reply<T>(resp: &Sender<T>, value: T) {
    if resp.send(value).is_err() {
        debug!("Requester went away before the reply");
    }
}

impl Broker {
    pub fn new(config: Arc<SpoolConfig>, recovered: Recovered) -> Self {
        let Recovered {
            store,
            checkpoint_store,
            replay,
            report,
        } = recovered;

        let mut held_bytes = 0;
        let pending: VecDeque<Entry> = replay
            .into_iter()
            .map(|e| {
                held_bytes += e.event.len() as u64;
                Entry {
                    sequence: e.sequence,
                    payload:  e.event,
                    producer: None,
                    position: e.position,
                }
            })
            .collect();

        let mut broker = Self {
            config,
            store,
            checkpoints: checkpoint_store,
            held_events: pending.len(),
            pending,
            outstanding: BTreeMap::new(),
            batches: HashMap::new(),
            producers: Slab::new(),
            parked_pushes: VecDeque::new(),
            parked_gets: VecDeque::new(),
            next_sequence: report.next_sequence,
            next_batch: 0,
            held_bytes,
            state: QueueState::Empty,
            drain_deadline: None,
            shutdown_waiters: Vec::new(),
            finalized: false,
        };
        broker.refresh_state();
        broker
    }

    /// Runs the request loop until shutdown completes.
    pub fn run(mut self, inbox: Inbox) {
        info!(
            next_sequence = self.next_sequence,
            unserved = self.pending.len(),
            "Broker started"
        );

        loop {
            let timeout = self.next_wakeup(Instant::now());
            select! {
                recv(inbox.push) -> msg => match msg {
                    Ok(req) => self.push(req, Instant::now()),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.get) -> msg => match msg {
                    Ok(req) => self.get(req, Instant::now()),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.ack) -> msg => match msg {
                    Ok(req) => self.ack(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.cancel_batch) -> msg => match msg {
                    Ok(req) => self.cancel_batch(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.cancel_producer) -> msg => match msg {
                    Ok(req) => self.cancel_producer(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.open) -> msg => match msg {
                    Ok(req) => self.open_producer(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.close) -> msg => match msg {
                    Ok(req) => self.close_producer(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.stats) -> msg => match msg {
                    Ok(req) => self.stats(req),
                    Err(_) => self.disconnected(),
                },
                recv(inbox.shutdown) -> msg => match msg {
                    Ok(req) => self.begin_shutdown(Some(req.resp), Instant::now()),
                    Err(_) => self.disconnected(),
                },
                default(timeout) => {}
            }

            let now = Instant::now();
            self.housekeeping(now);
            if self.is_done(now) {
                break;
            }
        }

        self.finalize(&inbox);
    }

    fn open_producer(&mut self, req: OpenProducer) {
        if self.is_stopping() {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        let id = self.producers.insert(ProducerSlot::default());
        debug!(producer = id, "Producer opened");
        reply(&req.resp, Ok(id));
    }

    fn close_producer(&mut self, req: CloseProducer) {
        let producer = req.producer;
        let Some(slot) = self.producers.get_mut(producer) else {
            return;
        };
        slot.closed = true;
        self.parked_pushes.retain(|p| {
            if p.producer == producer {
                reply(&p.resp, ClosedSnafu.fail());
                false
            } else {
                true
            }
        });
        debug!(producer, "Producer closed");
        self.resolve_producer(producer, 0);
    }

    fn push(&mut self, req: PushRequest, now: Instant) {
        if self.is_stopping() {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        match self.producers.get(req.producer) {
            None => {
                let err = InternalSnafu {
                    message: format!("unknown producer {}", req.producer),
                }
                .build();
                reply(&req.resp, Err(err));
                return;
            }
            Some(slot) if slot.canceled => {
                let err = ProducerCanceledSnafu {
                    producer: req.producer,
                }
                .build();
                reply(&req.resp, Err(err));
                return;
            }
            Some(_) => {}
        }

        self.try_resume();

        if self.parked_pushes.is_empty() && self.admits(req.payload.len()) {
            self.accept(req);
            self.serve_parked_gets();
            return;
        }

        if self.config.push_mode == PushMode::Reject || req.deadline.has_passed(now) {
            debug!(producer = req.producer, held = self.held_events, "Push refused, spool is full");
            reply(&req.resp, Ok(None));
            return;
        }

        debug!(
            producer = req.producer,
            parked = self.parked_pushes.len() + 1,
            "Push parked until space frees up"
        );
        self.parked_pushes.push_back(req);
    }

    fn accept(&mut self, req: PushRequest) {
        let sequence = self.next_sequence;
        match self.store.append(sequence, &req.payload) {
            Ok(position) => {
                self.next_sequence += 1;
                if let Some(slot) = self.producers.get_mut(req.producer) {
                    slot.pending += 1;
                }
                self.held_events += 1;
                self.held_bytes += req.payload.len() as u64;
                self.pending.push_back(Entry {
                    sequence,
                    payload: req.payload,
                    producer: Some(req.producer),
                    position,
                });
                debug!(sequence, producer = req.producer, "Accepted event");
                reply(&req.resp, Ok(Some(sequence)));
                self.refresh_state();
            }
            Err(e) => {
                if !e.is_retryable() {
                    warn!(error = %e, "Append failed, refusing pushes until the store recovers");
                }
                reply(&req.resp, Err(e));
            }
        }
    }

    fn admits(&self, len: usize) -> bool {
        self.held_events == 0
            || (self.held_events < self.config.max_events
                && self.held_bytes + len as u64 <= self.config.max_bytes)
    }

    /// Accepts parked pushes, oldest first, while there is room.
    fn admit_parked(&mut self) {
        while let Some(front) = self.parked_pushes.front()
            && self.admits(front.payload.len())
        {
            if let Some(req) = self.parked_pushes.pop_front() {
                self.accept(req);
            }
        }
        self.serve_parked_gets();
    }

    fn try_resume(&mut self) {
        if !self.store.is_poisoned() {
            return;
        }
        match self.store.recover() {
            Ok(()) => info!("Segment store recovered, accepting pushes again"),
            Err(e) => debug!(error = %e, "Segment store still paused"),
        }
    }

    fn cancel_producer(&mut self, req: ProducerCancelRequest) {
        if self.state == QueueState::Closed {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        let producer = req.producer;
        let Some(slot) = self.producers.get_mut(producer) else {
            reply(&req.resp, Ok(0));
            return;
        };
        slot.canceled = true;

        let before = self.pending.len();
        let mut removed_bytes = 0;
        self.pending.retain(|e| {
            let keep = e.producer != Some(producer);
            if !keep {
                removed_bytes += e.payload.len() as u64;
            }
            keep
        });
        let removed = before - self.pending.len();
        self.held_events -= removed;
        self.held_bytes -= removed_bytes;

        let mut rejected = 0;
        self.parked_pushes.retain(|p| {
            if p.producer == producer {
                reply(&p.resp, Err(ProducerCanceledSnafu { producer }.build()));
                rejected += 1;
                false
            } else {
                true
            }
        });

        info!(producer, removed, rejected, "Producer canceled");
        self.resolve_producer(producer, removed);
        reply(&req.resp, Ok(removed));

        // Removed entries stay in their segment. Only those ahead of every
        // unresolved entry move the durable read past them; the rest are
        // replayed, without a producer, if the spool restarts first.
        if removed > 0 {
            self.release();
            self.advance_checkpoint();
            self.admit_parked();
            self.refresh_state();
        }
    }

    fn get(&mut self, req: GetRequest, now: Instant) {
        if self.state == QueueState::Closed {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        if let Some(served) = self.serve(req.max_count) {
            self.deliver(&req.resp, served);
            return;
        }
        if self.state == QueueState::Draining {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        if req.deadline.has_passed(now) {
            reply(&req.resp, Ok(None));
            return;
        }
        debug!(parked = self.parked_gets.len() + 1, "Get parked until events arrive");
        self.parked_gets.push_back(req);
    }

    fn serve_parked_gets(&mut self) {
        while !self.pending.is_empty()
            && let Some(req) = self.parked_gets.pop_front()
        {
            if let Some(served) = self.serve(req.max_count) {
                self.deliver(&req.resp, served);
            }
        }
    }

    /// Hands a batch to its requester, taking it back if nobody is listening.
    fn deliver(&mut self, resp: &Sender<Result<Option<Served>>>, served: Served) {
        let id = served.id;
        if resp.send(Ok(Some(served))).is_err() {
            debug!(batch = id, "Consumer went away, returning batch");
            self.requeue(id);
        }
    }

    /// Moves the oldest unserved run into a new outstanding batch.
    ///
    /// The run stops before the first outstanding batch above it so batch
    /// ranges never interleave.
    fn serve(&mut self, max_count: usize) -> Option<Served> {
        let first = self.pending.front()?.sequence;
        let limit = self.outstanding.range(first..).next().map(|(start, _)| *start);
        let max_count = max_count.max(1);

        let mut entries = Vec::with_capacity(max_count.min(self.pending.len()));
        while entries.len() < max_count
            && let Some(entry) = self.pending.front()
            && limit.is_none_or(|limit| entry.sequence < limit)
        {
            entries.extend(self.pending.pop_front());
        }

        let id = self.next_batch;
        self.next_batch += 1;
        let events: Vec<Event> = entries
            .iter()
            .map(|e| Event {
                sequence: e.sequence,
                payload:  e.payload.clone(),
            })
            .collect();

        debug!(
            batch = id,
            first,
            last = events.last().map(|e| e.sequence),
            count = events.len(),
            "Served batch"
        );
        self.batches.insert(id, first);
        self.outstanding.insert(
            first,
            Outstanding {
                id,
                entries,
                acked: false,
            },
        );
        Some(Served { id, events })
    }

    fn ack(&mut self, req: AckRequest) {
        if self.state == QueueState::Closed {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        let status = self.acknowledge(req.batch);
        reply(&req.resp, Ok(status));
    }

    fn acknowledge(&mut self, batch: BatchId) -> AckStatus {
        let Some(&first) = self.batches.get(&batch) else {
            debug!(batch, "Ack for unknown batch ignored");
            return AckStatus::Ignored;
        };
        if self.outstanding.get(&first).is_none_or(|b| b.acked) {
            debug!(batch, "Ack for acknowledged batch ignored");
            return AckStatus::Ignored;
        }

        let mut implied = 0usize;
        for out in self.outstanding.range_mut(..=first).map(|(_, b)| b) {
            if !out.acked {
                out.acked = true;
                implied += 1;
            }
        }
        debug!(batch, implied = implied - 1, "Batch acknowledged");

        if self.release() > 0 {
            self.advance_checkpoint();
            self.admit_parked();
            self.refresh_state();
        }
        AckStatus::Acked
    }

    /// Drops acknowledged batches from the front. Returns the number of
    /// events released.
    fn release(&mut self) -> usize {
        let mut released = 0;
        while let Some(front) = self.outstanding.first_entry() {
            if !front.get().acked {
                break;
            }
            if self.pending.front().is_some_and(|p| p.sequence < *front.key()) {
                break;
            }
            let batch = front.remove();
            self.batches.remove(&batch.id);
            for entry in batch.entries {
                released += 1;
                self.held_events -= 1;
                self.held_bytes -= entry.payload.len() as u64;
                if let Some(producer) = entry.producer {
                    self.resolve_producer(producer, 1);
                }
            }
        }
        released
    }

    fn cancel_batch(&mut self, req: BatchCancelRequest) {
        if self.state == QueueState::Closed {
            reply(&req.resp, ClosedSnafu.fail());
            return;
        }
        let count = self.requeue(req.batch);
        reply(&req.resp, Ok(count));
        self.serve_parked_gets();
    }

    /// Returns an unacknowledged batch's entries to the unserved pool.
    fn requeue(&mut self, batch: BatchId) -> usize {
        let Some(&first) = self.batches.get(&batch) else {
            return 0;
        };
        if self.outstanding.get(&first).is_none_or(|b| b.acked) {
            return 0;
        }
        let Some(out) = self.outstanding.remove(&first) else {
            return 0;
        };
        self.batches.remove(&batch);

        let count = out.entries.len();
        let at = self.pending.partition_point(|e| e.sequence < first);
        let mut tail = self.pending.split_off(at);
        self.pending.extend(out.entries);
        self.pending.append(&mut tail);

        debug!(batch, first, count, "Batch returned for redelivery");
        count
    }

    fn resolve_producer(&mut self, producer: ProducerId, count: usize) {
        let Some(slot) = self.producers.get_mut(producer) else {
            return;
        };
        slot.pending = slot.pending.saturating_sub(count);
        if slot.closed && slot.pending == 0 {
            self.producers.remove(producer);
            debug!(producer, "Producer record released");
        }
    }

    fn stats(&self, req: StatsRequest) { reply(&req.resp, Ok(self.snapshot())); }

    fn snapshot(&self) -> SpoolStats {
        SpoolStats {
            state:               self.state,
            unserved:            self.pending.len(),
            outstanding_batches: self.outstanding.len(),
            outstanding_events:  self.held_events - self.pending.len(),
            held_bytes:          self.held_bytes,
            next_sequence:       self.next_sequence,
            durable_read:        self.checkpoints.persisted().read,
            paused:              self.store.is_poisoned(),
            producers:           self.producers.len(),
            parked_pushes:       self.parked_pushes.len(),
            parked_gets:         self.parked_gets.len(),
            sealed_segments:     self.store.sealed_count(),
        }
    }

    /// Position of the lowest unresolved event, or the end of the log.
    fn durable_read(&self) -> Position {
        let pending = self.pending.front().map(|e| e.position);
        let outstanding = self
            .outstanding
            .values()
            .next()
            .and_then(|b| b.entries.first())
            .map(|e| e.position);
        match (pending, outstanding) {
            (Some(a), Some(b)) => a.min(b),
            (Some(p), None) | (None, Some(p)) => p,
            (None, None) => self.store.write_position(),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version:       CHECKPOINT_VERSION,
            read:          self.durable_read(),
            write:         self.store.write_position(),
            next_sequence: self.next_sequence,
        }
    }

    fn advance_checkpoint(&mut self) {
        match self.checkpoints.update(self.checkpoint()) {
            Ok(true) => self.reclaim(),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to persist checkpoint"),
        }
    }

    fn reclaim(&mut self) {
        let read = self.checkpoints.persisted().read;
        match self.store.reclaim(read.segment) {
            Ok(0) => {}
            Ok(count) => info!(count, read = %read, "Reclaimed acknowledged segments"),
            Err(e) => warn!(error = %e, "Failed to reclaim segments"),
        }
    }

    fn refresh_state(&mut self) {
        if self.is_stopping() {
            return;
        }
        let next = if self.held_events == 0 {
            QueueState::Empty
        } else if self.held_events >= self.config.max_events
            || self.held_bytes >= self.config.max_bytes
        {
            QueueState::Full
        } else {
            QueueState::Active
        };
        self.set_state(next);
    }

    fn set_state(&mut self, next: QueueState) {
        if next != self.state {
            info!(from = %self.state, to = %next, held = self.held_events, "Spool state changed");
            self.state = next;
        }
    }

    const fn is_stopping(&self) -> bool {
        matches!(self.state, QueueState::Draining | QueueState::Closed)
    }

    /// How long the loop may sleep before something needs attention.
    fn next_wakeup(&self, now: Instant) -> Duration {
        let deadlines = self
            .parked_pushes
            .iter()
            .map(|r| r.deadline)
            .chain(self.parked_gets.iter().map(|r| r.deadline))
            .filter_map(|d| d.instant())
            .chain(self.drain_deadline)
            .map(|at| at.saturating_duration_since(now));

        deadlines
            .chain(self.store.flush_due_in())
            .chain(self.checkpoints.due_in())
            .fold(self.config.tick_interval, Duration::min)
    }

    fn housekeeping(&mut self, now: Instant) {
        let mut expired = 0;
        self.parked_pushes.retain(|r| {
            if r.deadline.has_passed(now) {
                reply(&r.resp, Ok(None));
                expired += 1;
                false
            } else {
                true
            }
        });
        self.parked_gets.retain(|r| {
            if r.deadline.has_passed(now) {
                reply(&r.resp, Ok(None));
                expired += 1;
                false
            } else {
                true
            }
        });
        if expired > 0 {
            debug!(expired, "Parked requests timed out");
        }

        self.try_resume();
        if !self.store.is_poisoned()
            && let Err(e) = self.store.maybe_flush()
        {
            error!(error = %e, "Periodic segment flush failed");
        }
        match self.checkpoints.tick() {
            Ok(true) => self.reclaim(),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to persist checkpoint"),
        }
    }

    fn begin_shutdown(&mut self, resp: Option<Sender<Result<()>>>, now: Instant) {
        self.shutdown_waiters.extend(resp);
        if self.is_stopping() {
            return;
        }
        info!(
            held = self.held_events,
            drain_timeout = ?self.config.drain_timeout,
            "Draining spool"
        );
        self.set_state(QueueState::Draining);
        self.drain_deadline = now.checked_add(self.config.drain_timeout);

        for req in self.parked_pushes.drain(..) {
            reply(&req.resp, ClosedSnafu.fail());
        }
        for req in self.parked_gets.drain(..) {
            reply(&req.resp, ClosedSnafu.fail());
        }
    }

    /// Every handle is gone, so nothing can be acked anymore.
    fn disconnected(&mut self) {
        let now = Instant::now();
        self.begin_shutdown(None, now);
        self.drain_deadline = Some(now);
    }

    fn is_done(&self, now: Instant) -> bool {
        self.state == QueueState::Draining
            && (self.held_events == 0 || self.drain_deadline.is_some_and(|d| d <= now))
    }

    /// Answers whatever raced with the shutdown, then flushes and persists.
    ///
    /// Queued acks, batch cancels and producer cancels are still applied so
    /// the final checkpoint reflects them; new events and gets are refused.
    fn finalize(&mut self, inbox: &Inbox) {
        for req in self.parked_pushes.drain(..) {
            reply(&req.resp, ClosedSnafu.fail());
        }
        for req in self.parked_gets.drain(..) {
            reply(&req.resp, ClosedSnafu.fail());
        }
        while let Ok(req) = inbox.open.try_recv() {
            reply(&req.resp, ClosedSnafu.fail());
        }
        while let Ok(req) = inbox.push.try_recv() {
            reply(&req.resp, ClosedSnafu.fail());
        }
        while let Ok(req) = inbox.get.try_recv() {
            reply(&req.resp, ClosedSnafu.fail());
        }

        while let Ok(req) = inbox.ack.try_recv() {
            self.ack(req);
        }
        while let Ok(req) = inbox.cancel_batch.try_recv() {
            self.cancel_batch(req);
        }
        while let Ok(req) = inbox.cancel_producer.try_recv() {
            self.cancel_producer(req);
        }
        while let Ok(req) = inbox.close.try_recv() {
            self.close_producer(req);
        }

        self.set_state(QueueState::Closed);
        while let Ok(req) = inbox.stats.try_recv() {
            self.stats(req);
        }
        while let Ok(req) = inbox.shutdown.try_recv() {
            self.shutdown_waiters.push(req.resp);
        }

        let result = self.persist();
        if let Err(e) = &result {
            error!(error = %e, "Failed to persist spool state on shutdown");
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let answer = match &result {
                Ok(()) => Ok(()),
                Err(e) => InternalSnafu {
                    message: format!("shutdown flush failed: {e}"),
                }
                .fail(),
            };
            reply(&waiter, answer);
        }
        self.finalized = true;

        info!(
            unacked = self.held_events,
            next_sequence = self.next_sequence,
            read = %self.checkpoints.persisted().read,
            "Broker stopped"
        );
    }

    fn persist(&mut self) -> Result<()> {
        self.try_resume();
        self.store.flush()?;
        self.checkpoints.update(self.checkpoint())?;
        self.checkpoints.flush()?;
        self.reclaim();
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        warn!("Broker stopped without a clean shutdown, persisting state");
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist spool state");
        }
    }
}
