// bgpsentry: Detection of Routing-Security Anomalies in Streams of BGP Updates
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Counters exposed at the system boundary. Errors inside the detection pipeline are never
//! propagated across prefixes; they end up here and in the log.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared counters, updated with relaxed atomics from all pipeline stages.
#[derive(Debug, Default)]
pub struct Counters {
    /// Updates that passed validation and were routed into a window or the late bucket.
    pub updates: AtomicU64,
    /// Updates rejected by the normalizer. The pipeline also counts the source entries it could
    /// not read.
    pub validation_errors: AtomicU64,
    /// Updates routed to the late bucket.
    pub late_updates: AtomicU64,
    pub windows_sealed: AtomicU64,
    pub windows_archived: AtomicU64,
    /// Prefixes whose state was re-initialized after an inconsistency.
    pub state_resets: AtomicU64,
    /// Detector evaluations skipped for lack of history.
    pub detector_skips: AtomicU64,
    /// Events that passed deduplication. The pipeline counts them once the sink persisted them,
    /// the engine once it returned them.
    pub events_emitted: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    /// Events dropped by the backpressure policy.
    pub events_dropped: AtomicU64,
    pub sink_failures: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            updates: get(&self.updates),
            validation_errors: get(&self.validation_errors),
            late_updates: get(&self.late_updates),
            windows_sealed: get(&self.windows_sealed),
            windows_archived: get(&self.windows_archived),
            state_resets: get(&self.state_resets),
            detector_skips: get(&self.detector_skips),
            events_emitted: get(&self.events_emitted),
            duplicates_suppressed: get(&self.duplicates_suppressed),
            events_dropped: get(&self.events_dropped),
            sink_failures: get(&self.sink_failures),
        }
    }
}

/// Point-in-time copy of all [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub updates: u64,
    pub validation_errors: u64,
    pub late_updates: u64,
    pub windows_sealed: u64,
    pub windows_archived: u64,
    pub state_resets: u64,
    pub detector_skips: u64,
    pub events_emitted: u64,
    pub duplicates_suppressed: u64,
    pub events_dropped: u64,
    pub sink_failures: u64,
}

impl std::fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "updates: {} (invalid: {}, late: {}), windows: {} sealed / {} archived, resets: {}, skips: {}, events: {} emitted / {} duplicates / {} dropped, sink failures: {}",
            self.updates,
            self.validation_errors,
            self.late_updates,
            self.windows_sealed,
            self.windows_archived,
            self.state_resets,
            self.detector_skips,
            self.events_emitted,
            self.duplicates_suppressed,
            self.events_dropped,
            self.sink_failures,
        )
    }
}
