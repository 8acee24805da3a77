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
//! Windowing of the update stream.
//!
//! Time is divided into half-open buckets `[k * d, (k + 1) * d)` of a fixed duration `d`. The
//! [`WindowManager`] routes each update into the open window of its prefix. A window is sealed
//! when its prefix receives an update for a later bucket, or when the global [`Watermark`] has
//! passed the end of the window by more than the lateness tolerance. Either way, a sealed window
//! is only released for evaluation once the watermark passed its end by the lateness tolerance,
//! such that the covering prefixes owned by the same worker had their windows of the same bucket
//! sealed in the same batch. Updates that would need a
//! sealed window, or that are older than the watermark minus the lateness tolerance, are put into
//! the [`LateBucket`] and never reach the detectors.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::{
    detectors::path_loop::find_loops,
    prefix_index::PrefixIndex,
    records::{PeerId, UpdateKind, UpdateRecord},
    state::{PrefixEntry, SealedWindow, StateError},
    stats::Counters,
    Asn, Bucket, Prefix,
};

/// Number of late updates kept for reporting.
const LATE_SAMPLES: usize = 64;
/// Number of sample AS paths kept per origin.
const SAMPLE_PATHS: usize = 3;

/// Boundaries of a window, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowBounds {
    pub bucket: Bucket,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    pub fn new(bucket: Bucket, bucket_ms: i64) -> Self {
        Self {
            bucket,
            start: millis(bucket.saturating_mul(bucket_ms)),
            end: millis(bucket.saturating_add(1).saturating_mul(bucket_ms)),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Bucket of a timestamp given in milliseconds.
pub fn bucket_of(ts_ms: i64, bucket_ms: i64) -> Bucket {
    ts_ms.div_euclid(bucket_ms)
}

/// Occurrences of a single origin within a window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginStats {
    pub count: u64,
    pub peers: BTreeSet<PeerId>,
    pub sample_paths: Vec<Vec<Asn>>,
}

/// First occurrence of a repeated AS within a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOccurrence {
    pub repeat_as: Asn,
    pub first_idx: usize,
    pub second_idx: usize,
    pub peer: PeerId,
    pub as_path: Vec<Asn>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate of all updates of one prefix within one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    pub bounds: WindowBounds,
    pub origins: BTreeMap<Asn, OriginStats>,
    pub peers: BTreeSet<PeerId>,
    /// Loops by repeated AS, keeping the first occurrence only.
    pub loops: BTreeMap<Asn, LoopOccurrence>,
    pub transitions: u64,
    pub announcements: u64,
    pub withdrawals: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl WindowState {
    pub fn new(bounds: WindowBounds, first: DateTime<Utc>) -> Self {
        Self {
            bounds,
            origins: BTreeMap::new(),
            peers: BTreeSet::new(),
            loops: BTreeMap::new(),
            transitions: 0,
            announcements: 0,
            withdrawals: 0,
            first_update: first,
            last_update: first,
        }
    }

    pub(crate) fn apply(&mut self, update: &UpdateRecord, transition: bool, ignore_prepending: bool) {
        self.first_update = self.first_update.min(update.timestamp);
        self.last_update = self.last_update.max(update.timestamp);
        self.peers.insert(update.peer);
        if transition {
            self.transitions += 1;
        }
        match update.kind {
            UpdateKind::Withdraw => self.withdrawals += 1,
            UpdateKind::Announce => {
                self.announcements += 1;
                if let Some(origin) = update.origin() {
                    let stats = self.origins.entry(origin).or_default();
                    stats.count += 1;
                    stats.peers.insert(update.peer);
                    if stats.sample_paths.len() < SAMPLE_PATHS
                        && !stats.sample_paths.contains(&update.as_path)
                    {
                        stats.sample_paths.push(update.as_path.clone());
                    }
                }
                for (repeat_as, first_idx, second_idx) in
                    find_loops(&update.as_path, ignore_prepending)
                {
                    self.loops.entry(repeat_as).or_insert_with(|| LoopOccurrence {
                        repeat_as,
                        first_idx,
                        second_idx,
                        peer: update.peer,
                        as_path: update.as_path.clone(),
                        timestamp: update.timestamp,
                    });
                }
            }
        }
    }

    /// Number of updates applied to this window.
    pub fn total_events(&self) -> u64 {
        self.announcements + self.withdrawals
    }

    /// The most frequent origin. Ties go to the lowest ASN.
    pub fn top_origin(&self) -> Option<Asn> {
        self.origins
            .iter()
            .max_by(|(a_asn, a), (b_asn, b)| a.count.cmp(&b.count).then(b_asn.cmp(a_asn)))
            .map(|(asn, _)| *asn)
    }

    /// Number of occurrences per origin.
    pub fn origin_counts(&self) -> BTreeMap<Asn, u64> {
        self.origins.iter().map(|(a, s)| (*a, s.count)).collect()
    }

    /// Number of distinct peers that observed `origin`.
    pub fn origin_peers(&self, origin: Asn) -> usize {
        self.origins.get(&origin).map_or(0, |s| s.peers.len())
    }
}

/// Latest event time seen on any input, shared by all workers.
#[derive(Debug)]
pub struct Watermark(AtomicI64);

impl Default for Watermark {
    fn default() -> Self {
        Self(AtomicI64::new(i64::MIN))
    }
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the watermark to `ts_ms` (if later) and return the new watermark.
    pub fn advance(&self, ts_ms: i64) -> i64 {
        self.0.fetch_max(ts_ms, Ordering::AcqRel).max(ts_ms)
    }

    /// Current watermark, or `None` before the first update.
    pub fn get(&self) -> Option<i64> {
        Some(self.0.load(Ordering::Acquire)).filter(|x| *x != i64::MIN)
    }
}

/// Why an update was routed to the late bucket.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter,
)]
pub enum LateReason {
    /// Older than the watermark minus the lateness tolerance.
    TooOld,
    /// Its window was already sealed.
    WindowSealed,
    /// The prefix already has an open window for a later bucket.
    BehindOpenWindow,
}

/// Late updates: counted and kept for reporting, excluded from detection.
#[derive(Debug, Default)]
pub struct LateBucket {
    counts: BTreeMap<LateReason, u64>,
    recent: VecDeque<(LateReason, UpdateRecord)>,
}

impl LateBucket {
    fn push(&mut self, reason: LateReason, update: UpdateRecord) {
        *self.counts.entry(reason).or_default() += 1;
        if self.recent.len() == LATE_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back((reason, update));
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, reason: LateReason) -> u64 {
        self.counts.get(&reason).copied().unwrap_or_default()
    }

    /// The most recent late updates, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &(LateReason, UpdateRecord)> {
        self.recent.iter()
    }
}

/// Where an update went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Applied(Bucket),
    Late(LateReason),
    /// The update revealed an inconsistent prefix state. The state was reset and the update
    /// discarded.
    Reset,
}

/// A sealed window, ready for detector evaluation.
#[derive(Debug, Clone)]
pub struct SealedJob {
    pub entry: Arc<PrefixEntry>,
    pub window: SealedWindow,
}

impl SealedJob {
    pub fn prefix(&self) -> Prefix {
        self.entry.prefix
    }

    pub fn bucket(&self) -> Bucket {
        self.window.bounds.bucket
    }
}

/// Window manager of one worker. It must only see updates of the prefixes it owns.
#[derive(Debug)]
pub struct WindowManager {
    index: Arc<PrefixIndex>,
    watermark: Arc<Watermark>,
    counters: Arc<Counters>,
    bucket_ms: i64,
    lateness_ms: i64,
    flap_interval: Option<Duration>,
    ignore_prepending: bool,
    /// Prefixes of this worker having an open window.
    open: HashMap<Prefix, Arc<PrefixEntry>>,
    /// Windows sealed because their prefix moved on to a later bucket, waiting for the horizon
    /// to pass their end.
    held: Vec<SealedJob>,
    /// Bucket of the sealing horizon at the last sweep.
    last_sweep: Option<Bucket>,
    late: LateBucket,
}

impl WindowManager {
    pub fn new(
        index: Arc<PrefixIndex>,
        watermark: Arc<Watermark>,
        counters: Arc<Counters>,
        bucket: Duration,
        lateness: Duration,
        flap_interval: Option<Duration>,
        ignore_prepending: bool,
    ) -> Self {
        Self {
            index,
            watermark,
            counters,
            bucket_ms: i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1),
            lateness_ms: i64::try_from(lateness.as_millis()).unwrap_or(i64::MAX),
            flap_interval,
            ignore_prepending,
            open: HashMap::new(),
            held: Vec::new(),
            last_sweep: None,
            late: LateBucket::default(),
        }
    }

    pub fn late(&self) -> &LateBucket {
        &self.late
    }

    /// Number of windows currently open in this worker.
    pub fn num_open(&self) -> usize {
        self.open.len()
    }

    /// Number of sealed windows not yet released for evaluation.
    pub fn num_held(&self) -> usize {
        self.held.len()
    }

    /// Route an update into the window of its prefix, sealing the previous window of that prefix
    /// if the update belongs to a later bucket. That window is held back until a sweep releases
    /// it.
    pub fn route(&mut self, update: UpdateRecord) -> Routed {
        Counters::bump(&self.counters.updates);
        let ts = update.timestamp_millis();
        let bucket = bucket_of(ts, self.bucket_ms);
        let watermark = self.watermark.advance(ts);

        if ts < watermark.saturating_sub(self.lateness_ms) {
            return self.route_late(LateReason::TooOld, update);
        }

        let entry = self.index.insert(update.prefix);
        let mut state = entry.lock();

        if state.last_sealed().is_some_and(|last| bucket <= last) {
            drop(state);
            return self.route_late(LateReason::WindowSealed, update);
        }

        match state.open_bucket() {
            Some(open) if bucket < open => {
                drop(state);
                return self.route_late(LateReason::BehindOpenWindow, update);
            }
            Some(open) if bucket > open => {
                if let Some(window) = state.seal() {
                    log::debug!("Sealed {} bucket {} (superseded)", entry.prefix, open);
                    Counters::bump(&self.counters.windows_sealed);
                    self.held.push(SealedJob {
                        entry: entry.clone(),
                        window,
                    });
                }
            }
            _ => {}
        }

        let result = match state.open_bucket() {
            Some(_) => Ok(()),
            None => state.open(WindowBounds::new(bucket, self.bucket_ms), update.timestamp),
        }
        .and_then(|_| state.apply(bucket, &update, self.flap_interval, self.ignore_prepending));

        match result {
            Ok(()) => {
                log::trace!("{} -> {} bucket {}", update.collector, update.prefix, bucket);
                self.open.insert(entry.prefix, entry.clone());
                Routed::Applied(bucket)
            }
            Err(e) => {
                drop(state);
                self.recover(&entry, e);
                Routed::Reset
            }
        }
    }

    fn route_late(&mut self, reason: LateReason, update: UpdateRecord) -> Routed {
        log::debug!(
            "Late update ({reason}) for {} at {} from {}",
            update.prefix, update.timestamp, update.collector
        );
        Counters::bump(&self.counters.late_updates);
        self.late.push(reason, update);
        Routed::Late(reason)
    }

    /// Re-initialize the state of a prefix after an inconsistency.
    pub fn recover(&mut self, entry: &PrefixEntry, error: StateError) {
        log::error!("{error}. Resetting the state of {}", entry.prefix);
        entry.lock().reset();
        self.open.remove(&entry.prefix);
        Counters::bump(&self.counters.state_resets);
    }

    /// Seal all windows whose end lies more than the lateness tolerance behind the watermark.
    ///
    /// Windows only become due when the horizon (watermark minus lateness) enters a new bucket,
    /// so this returns immediately if the horizon did not cross a bucket boundary since the last
    /// sweep.
    pub fn sweep(&mut self) -> Vec<SealedJob> {
        let Some(wm) = self.watermark.get() else {
            return Vec::new();
        };
        let until = wm.saturating_sub(self.lateness_ms);
        let horizon = bucket_of(until, self.bucket_ms);
        if self.last_sweep == Some(horizon) {
            return Vec::new();
        }
        self.last_sweep = Some(horizon);
        self.sweep_until(until)
    }

    /// Seal all windows that end at or before `until_ms`, and release them together with the held
    /// windows ending by then. Jobs are sorted by bucket and prefix.
    pub fn sweep_until(&mut self, until_ms: i64) -> Vec<SealedJob> {
        let due = self
            .open
            .iter()
            .filter(|(_, entry)| {
                entry
                    .lock()
                    .open_window()
                    .map_or(true, |w| w.bounds.end.timestamp_millis() <= until_ms)
            })
            .map(|(p, _)| *p)
            .collect_vec();
        let (mut jobs, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|j| j.window.bounds.end.timestamp_millis() <= until_ms);
        self.held = held;
        self.seal_all(due, &mut jobs);
        jobs.sort_by_key(|j| (j.bucket(), j.prefix()));
        jobs
    }

    /// Seal every open window and release all held ones, as on shutdown.
    pub fn flush(&mut self) -> Vec<SealedJob> {
        let all = self.open.keys().copied().collect_vec();
        let mut jobs = std::mem::take(&mut self.held);
        self.seal_all(all, &mut jobs);
        jobs.sort_by_key(|j| (j.bucket(), j.prefix()));
        jobs
    }

    fn seal_all(&mut self, prefixes: Vec<Prefix>, jobs: &mut Vec<SealedJob>) {
        for prefix in prefixes {
            let Some(entry) = self.open.remove(&prefix) else {
                continue;
            };
            let window = entry.lock().seal();
            if let Some(window) = window {
                log::debug!("Sealed {} bucket {}", prefix, window.bounds.bucket);
                Counters::bump(&self.counters.windows_sealed);
                jobs.push(SealedJob { entry, window });
            }
        }
    }
}
