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
//! Per-prefix state machine.
//!
//! A prefix has at most one open [`WindowState`]. Sealing moves the open window out of the state,
//! leaving a read-only [`SealedWindow`] that is handed to the detectors. Once all detectors have
//! run, the window is archived: its origin counts are merged into the [`BaselineOrigin`] and the
//! window itself is released. Windows are archived in the order they were sealed.

use std::{
    collections::{BTreeMap, VecDeque},
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    records::{UpdateKind, UpdateRecord},
    window::{WindowBounds, WindowState},
    Asn, Bucket, Prefix,
};

/// Number of closed-window summaries kept per prefix for the sub-prefix comparison.
const CLOSED_SUMMARIES: usize = 8;

/// Internal inconsistency of a prefix's state. The affected prefix is re-initialized; all other
/// prefixes continue unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("{prefix} already has an open window for bucket {open}, cannot open bucket {new}")]
    TwoOpenWindows {
        prefix: Prefix,
        open: Bucket,
        new: Bucket,
    },
    #[error("{prefix} has no open window for bucket {bucket}")]
    NoOpenWindow { prefix: Prefix, bucket: Bucket },
    #[error("Bucket {bucket} of {prefix} is not after the last sealed bucket {last}")]
    BucketRegression {
        prefix: Prefix,
        bucket: Bucket,
        last: Bucket,
    },
    #[error("Bucket {bucket} of {prefix} archived out of order (expected {expected:?})")]
    ArchiveOutOfOrder {
        prefix: Prefix,
        bucket: Bucket,
        expected: Option<Bucket>,
    },
}

/// Parameters of the baseline vote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselinePolicy {
    /// Number of closed buckets before the current one that take part in the vote.
    pub lookback: u64,
    /// Weight factor per bucket of age.
    pub decay: f64,
}

impl Default for BaselinePolicy {
    fn default() -> Self {
        Self {
            lookback: 2016,
            decay: 1.0,
        }
    }
}

/// The origin most frequently seen for a prefix over a bounded lookback of closed windows.
///
/// Only closed windows are ever absorbed, and [`BaselineOrigin::origin_before`] only considers
/// buckets strictly before the one being evaluated.
#[derive(Debug, Clone, Default)]
pub struct BaselineOrigin {
    history: VecDeque<(Bucket, BTreeMap<Asn, u64>)>,
    origin: Option<Asn>,
}

impl BaselineOrigin {
    /// Baseline after the last absorbed window.
    pub fn current(&self) -> Option<Asn> {
        self.origin
    }

    /// Merge the origin counts of a closed window, evict buckets that dropped out of the
    /// lookback, and recompute the baseline.
    pub fn absorb(&mut self, bucket: Bucket, origins: BTreeMap<Asn, u64>, policy: BaselinePolicy) {
        if !origins.is_empty() {
            self.history.push_back((bucket, origins));
        }
        let oldest = bucket.saturating_sub(policy.lookback as i64 - 1);
        while self.history.front().is_some_and(|(b, _)| *b < oldest) {
            self.history.pop_front();
        }
        self.origin = self.vote(bucket + 1, policy);
    }

    /// Baseline as seen by the window of `bucket`: only closed buckets in
    /// `[bucket - lookback, bucket)` vote.
    pub fn origin_before(&self, bucket: Bucket, policy: BaselinePolicy) -> Option<Asn> {
        self.vote(bucket, policy)
    }

    fn vote(&self, bucket: Bucket, policy: BaselinePolicy) -> Option<Asn> {
        let oldest = bucket.saturating_sub(policy.lookback as i64);
        let mut scores: BTreeMap<Asn, f64> = BTreeMap::new();
        for (b, origins) in self.history.iter().filter(|(b, _)| *b >= oldest && *b < bucket) {
            let weight = policy.decay.powi((bucket - 1 - b).min(i32::MAX as i64) as i32);
            for (asn, count) in origins {
                *scores.entry(*asn).or_default() += weight * *count as f64;
            }
        }
        let best = scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
        let tied = || {
            scores
                .iter()
                .filter(move |(_, s)| (best - **s).abs() <= f64::EPSILON * best.abs().max(1.0))
                .map(|(a, _)| *a)
        };
        // keep the previous baseline on a tie, otherwise the lowest ASN wins.
        match self.origin {
            Some(prev) if tied().any(|a| a == prev) => Some(prev),
            _ => tied().next(),
        }
    }

    /// Number of closed buckets currently remembered.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Digest of a sealed window, kept after the window itself was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSummary {
    pub bucket: Bucket,
    pub top_origin: Option<Asn>,
    pub origins: BTreeMap<Asn, u64>,
}

/// Read-only window handed to the detectors.
#[derive(Debug, Clone)]
pub struct SealedWindow {
    window: Arc<WindowState>,
    generation: u64,
}

impl SealedWindow {
    /// Generation of the prefix state that sealed this window. Windows sealed before a reset
    /// of the prefix state are not archived.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for SealedWindow {
    type Target = WindowState;

    fn deref(&self) -> &Self::Target {
        &self.window
    }
}

/// Mutable state of a single prefix.
#[derive(Debug)]
pub struct PrefixState {
    prefix: Prefix,
    open: Option<WindowState>,
    /// Sealed buckets that are not yet archived, in sealing order.
    pending: VecDeque<Bucket>,
    last_sealed: Option<Bucket>,
    last_archived: Option<Bucket>,
    last_update: Option<(UpdateKind, DateTime<Utc>)>,
    closed: VecDeque<ClosedSummary>,
    baseline: BaselineOrigin,
    generation: u64,
}

impl PrefixState {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            open: None,
            pending: VecDeque::new(),
            last_sealed: None,
            last_archived: None,
            last_update: None,
            closed: VecDeque::new(),
            baseline: BaselineOrigin::default(),
            generation: 0,
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn open_window(&self) -> Option<&WindowState> {
        self.open.as_ref()
    }

    pub fn open_bucket(&self) -> Option<Bucket> {
        self.open.as_ref().map(|w| w.bounds.bucket)
    }

    pub fn last_sealed(&self) -> Option<Bucket> {
        self.last_sealed
    }

    pub fn last_archived(&self) -> Option<Bucket> {
        self.last_archived
    }

    pub fn baseline(&self) -> &BaselineOrigin {
        &self.baseline
    }

    /// Summaries of the most recently closed windows, oldest first.
    pub fn closed_summaries(&self) -> impl Iterator<Item = &ClosedSummary> {
        self.closed.iter()
    }

    /// Latest closed-window summary at or before `bucket`.
    pub fn closed_summary(&self, bucket: Bucket) -> Option<&ClosedSummary> {
        self.closed.iter().rev().find(|s| s.bucket <= bucket)
    }

    /// Open a new window. Fails if another window is still open or the bucket is not after the
    /// last sealed one.
    pub fn open(&mut self, bounds: WindowBounds, first: DateTime<Utc>) -> Result<(), StateError> {
        if let Some(open) = self.open_bucket() {
            return Err(StateError::TwoOpenWindows {
                prefix: self.prefix,
                open,
                new: bounds.bucket,
            });
        }
        if let Some(last) = self.last_sealed.filter(|last| bounds.bucket <= *last) {
            return Err(StateError::BucketRegression {
                prefix: self.prefix,
                bucket: bounds.bucket,
                last,
            });
        }
        self.open = Some(WindowState::new(bounds, first));
        Ok(())
    }

    /// Apply an update to the open window of `bucket`. A transition is counted if the kind
    /// differs from the previous update of this prefix (within `flap_interval`, if given).
    pub fn apply(
        &mut self,
        bucket: Bucket,
        update: &UpdateRecord,
        flap_interval: Option<Duration>,
        ignore_prepending: bool,
    ) -> Result<(), StateError> {
        let transition = match self.last_update {
            Some((kind, at)) if kind != update.kind => flap_interval.map_or(true, |max| {
                (update.timestamp - at)
                    .abs()
                    .to_std()
                    .map_or(false, |gap| gap <= max)
            }),
            _ => false,
        };
        let prefix = self.prefix;
        let window = self
            .open
            .as_mut()
            .filter(|w| w.bounds.bucket == bucket)
            .ok_or(StateError::NoOpenWindow { prefix, bucket })?;
        window.apply(update, transition, ignore_prepending);
        self.last_update = Some((update.kind, update.timestamp));
        Ok(())
    }

    /// Seal the open window.
    pub fn seal(&mut self) -> Option<SealedWindow> {
        let window = self.open.take()?;
        let bucket = window.bounds.bucket;
        self.closed.push_back(ClosedSummary {
            bucket,
            top_origin: window.top_origin(),
            origins: window.origin_counts(),
        });
        while self.closed.len() > CLOSED_SUMMARIES {
            self.closed.pop_front();
        }
        self.pending.push_back(bucket);
        self.last_sealed = Some(bucket);
        Some(SealedWindow {
            window: Arc::new(window),
            generation: self.generation,
        })
    }

    /// Archive a sealed window after all detectors ran on it, merging its origins into the
    /// baseline. Returns `false` if the window belongs to a state that was reset since.
    pub fn archive(
        &mut self,
        window: &SealedWindow,
        policy: BaselinePolicy,
    ) -> Result<bool, StateError> {
        if window.generation != self.generation {
            return Ok(false);
        }
        let bucket = window.bounds.bucket;
        if self.pending.front() != Some(&bucket) {
            return Err(StateError::ArchiveOutOfOrder {
                prefix: self.prefix,
                bucket,
                expected: self.pending.front().copied(),
            });
        }
        self.pending.pop_front();
        self.baseline.absorb(bucket, window.origin_counts(), policy);
        self.last_archived = Some(bucket);
        Ok(true)
    }

    /// Forget everything about this prefix but the time up to which windows were sealed, such
    /// that no sealed window can ever be reopened.
    pub fn reset(&mut self) {
        let last_sealed = self.last_sealed.max(self.open_bucket());
        let generation = self.generation + 1;
        *self = Self::new(self.prefix);
        self.last_sealed = last_sealed;
        self.generation = generation;
    }
}

/// Entry of a tracked prefix in the [`crate::prefix_index::PrefixIndex`].
#[derive(Debug)]
pub struct PrefixEntry {
    pub prefix: Prefix,
    state: Mutex<PrefixState>,
}

impl PrefixEntry {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            state: Mutex::new(PrefixState::new(prefix)),
        }
    }

    /// Lock the state of this prefix. A poisoned lock is recovered, as the state is reset on
    /// any inconsistency anyways.
    pub fn lock(&self) -> MutexGuard<'_, PrefixState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current baseline origin of this prefix.
    pub fn baseline(&self) -> Option<Asn> {
        self.lock().baseline.current()
    }
}
