// EdgeRelay - IoT edge relay node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Latency ledger
//!
//! [`MetricsLedger`] accumulates two totals, in seconds: time spent
//! transmitting and time spent processing. Both only ever grow. The pair sits
//! behind one mutex so a [`snapshot`](MetricsLedger::snapshot) is never torn.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Consistent view of both ledger totals, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    /// Accumulated transmission time
    pub transmission: f64,
    /// Accumulated processing time
    pub processing: f64,
}

impl LedgerSnapshot {
    /// Sum of both totals
    pub fn total(&self) -> f64 {
        self.transmission + self.processing
    }
}

/// Accumulate-only counter pair shared by workers and inbound handlers
#[derive(Debug, Default)]
pub struct MetricsLedger {
    totals: Mutex<LedgerSnapshot>,
}

impl MetricsLedger {
    /// Create a ledger with both totals at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` seconds of processing time
    pub fn add_processing_time(&self, delta: f64) {
        if Self::accept(delta, "processing") {
            self.lock().processing += delta;
        }
    }

    /// Add `delta` seconds of transmission time
    pub fn add_transmission_time(&self, delta: f64) {
        if Self::accept(delta, "transmission") {
            self.lock().transmission += delta;
        }
    }

    /// Add a measured processing duration
    pub fn add_processing(&self, elapsed: Duration) {
        self.add_processing_time(elapsed.as_secs_f64());
    }

    /// Add a measured transmission duration
    pub fn add_transmission(&self, elapsed: Duration) {
        self.add_transmission_time(elapsed.as_secs_f64());
    }

    /// Read both totals under the same lock
    pub fn snapshot(&self) -> LedgerSnapshot {
        *self.lock()
    }

    // Totals must stay monotonic; a negative or NaN delta would break that.
    fn accept(delta: f64, field: &str) -> bool {
        if delta.is_finite() && delta >= 0.0 {
            true
        } else {
            warn!("Ignoring invalid {} time delta: {}", field, delta);
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerSnapshot> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ledger_starts_at_zero() {
        let ledger = MetricsLedger::new();
        assert_eq!(ledger.snapshot(), LedgerSnapshot::default());
    }

    #[test]
    fn test_ledger_accumulates() {
        let ledger = MetricsLedger::new();
        ledger.add_processing_time(1.25);
        ledger.add_processing_time(0.75);
        ledger.add_transmission_time(0.5);
        ledger.add_transmission(Duration::from_millis(250));

        let snap = ledger.snapshot();
        assert_relative_eq!(snap.processing, 2.0);
        assert_relative_eq!(snap.transmission, 0.75);
        assert_relative_eq!(snap.total(), 2.75);
    }

    #[test]
    fn test_ledger_ignores_invalid_deltas() {
        let ledger = MetricsLedger::new();
        ledger.add_processing_time(1.0);
        ledger.add_processing_time(-0.5);
        ledger.add_processing_time(f64::NAN);
        ledger.add_transmission_time(f64::INFINITY);

        let snap = ledger.snapshot();
        assert_relative_eq!(snap.processing, 1.0);
        assert_relative_eq!(snap.transmission, 0.0);
    }

    #[test]
    fn test_ledger_concurrent_adds_are_not_lost() {
        let ledger = Arc::new(MetricsLedger::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        // Multiples of 1/8 keep every partial sum exact.
                        let delta = ((t + i) % 4) as f64 * 0.125;
                        if i % 2 == 0 {
                            ledger.add_processing_time(delta);
                        } else {
                            ledger.add_transmission_time(delta);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut expected_processing = 0.0;
        let mut expected_transmission = 0.0;
        for t in 0..threads {
            for i in 0..per_thread {
                let delta = ((t + i) % 4) as f64 * 0.125;
                if i % 2 == 0 {
                    expected_processing += delta;
                } else {
                    expected_transmission += delta;
                }
            }
        }

        let snap = ledger.snapshot();
        assert_relative_eq!(snap.processing, expected_processing, epsilon = 1e-9);
        assert_relative_eq!(snap.transmission, expected_transmission, epsilon = 1e-9);
    }
}
