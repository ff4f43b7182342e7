// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Ingest queue
//!
//! Unbounded FIFO between the inbound handlers and the processing workers.
//! [`push`](IngestQueue::push) never blocks and never drops;
//! [`pop`](IngestQueue::pop) suspends until an entry arrives or the queue is
//! closed. After [`close`](IngestQueue::close), entries already queued are
//! still handed out; `pop` returns `None` once the queue is closed and empty.
//!
//! The queue is unbounded on purpose: a benchmark run has a known length, and
//! losing IoT data would skew the measurement more than memory growth does.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::protocol::WorkBatch;

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Entry queued; carries the depth after the push
    Queued(usize),
    /// Queue already closed, entry refused
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<WorkBatch>,
    closed: bool,
}

/// Multi-producer, multi-consumer FIFO of [`WorkBatch`]es
#[derive(Debug, Default)]
pub struct IngestQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Never blocks.
    pub fn push(&self, batch: WorkBatch) -> PushOutcome {
        let depth = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            inner.entries.push_back(batch);
            inner.entries.len()
        };
        self.available.notify_one();
        PushOutcome::Queued(depth)
    }

    /// Take the oldest entry, waiting while the queue is open and empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<WorkBatch> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push or close between the check
            // and the await is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(batch) = inner.entries.pop_front() {
                    let more = !inner.entries.is_empty();
                    drop(inner);
                    if more {
                        // Pass the wakeup on in case several pushes coalesced.
                        self.available.notify_one();
                    }
                    return Some(batch);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the oldest entry without waiting
    pub fn try_pop(&self) -> Option<WorkBatch> {
        self.lock().entries.pop_front()
    }

    /// Refuse further pushes and wake every waiting popper
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
