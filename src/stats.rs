// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Relay event counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Event counters shared by the inbound handlers and the workers
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Data batches accepted into the ingest queue
    pub batches_received: AtomicU64,
    /// Batches processed and handed to the upstream
    pub batches_processed: AtomicU64,
    /// Batches dropped because processing failed
    pub batches_failed: AtomicU64,
    /// Inbound messages dropped (unknown session, malformed, queue closed)
    pub messages_dropped: AtomicU64,
    /// Upstream emits that returned an error
    pub emits_failed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub batches_received: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub messages_dropped: u64,
    pub emits_failed: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emit_failed(&self) {
        self.emits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            emits_failed: self.emits_failed.load(Ordering::Relaxed),
        }
    }
}
