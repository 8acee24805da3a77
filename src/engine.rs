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
//! Detector evaluation of sealed windows, and a synchronous engine driving all stages from a
//! single owner.

use std::{collections::BTreeMap, sync::Arc};

use rayon::prelude::*;

use crate::{
    config::{ConfigError, DetectorConfig},
    detectors::{DetectionContext, DetectorSet},
    emitter::Deduplicator,
    event::AnomalyEvent,
    normalizer::{normalize, ValidationError},
    prefix_index::PrefixIndex,
    records::{RawUpdate, UpdateRecord},
    state::BaselinePolicy,
    stats::{CounterSnapshot, Counters},
    window::{LateBucket, SealedJob, Watermark, WindowManager},
    Prefix,
};

/// Runs the detectors on sealed windows and archives them afterwards.
#[derive(Debug)]
pub struct Evaluator {
    detectors: DetectorSet,
    index: Arc<PrefixIndex>,
    counters: Arc<Counters>,
    policy: BaselinePolicy,
}

impl Evaluator {
    pub fn new(
        detectors: DetectorSet,
        index: Arc<PrefixIndex>,
        counters: Arc<Counters>,
        policy: BaselinePolicy,
    ) -> Self {
        Self {
            detectors,
            index,
            counters,
            policy,
        }
    }

    pub fn from_config(
        config: &DetectorConfig,
        index: Arc<PrefixIndex>,
        counters: Arc<Counters>,
    ) -> Self {
        Self::new(
            DetectorSet::from_config(config),
            index,
            counters,
            BaselinePolicy {
                lookback: config.baseline_lookback_buckets,
                decay: config.baseline_decay,
            },
        )
    }

    /// Evaluate a single sealed window, then archive it into the prefix's baseline.
    ///
    /// The prefix lock is only held to read the baseline and to archive; the detectors run
    /// without it, as they may need to lock the covering parent.
    pub fn evaluate_job(&self, job: &SealedJob) -> Vec<AnomalyEvent> {
        let prefix = job.prefix();
        let bucket = job.bucket();
        let baseline = job.entry.lock().baseline().origin_before(bucket, self.policy);

        let ctx = DetectionContext {
            prefix,
            window: &job.window,
            baseline,
            index: &self.index,
        };
        let evaluation = self.detectors.evaluate(&ctx);
        for (kind, reason) in &evaluation.skipped {
            log::debug!("Skipped {kind} on {prefix} bucket {bucket}: {reason}");
            Counters::bump(&self.counters.detector_skips);
        }

        let archived = job.entry.lock().archive(&job.window, self.policy);
        match archived {
            Ok(true) => {
                log::debug!("Archived {prefix} bucket {bucket}");
                Counters::bump(&self.counters.windows_archived);
            }
            Ok(false) => log::debug!("Discarded {prefix} bucket {bucket} sealed before a reset"),
            Err(e) => {
                log::error!("{e}. Resetting the state of {prefix}");
                job.entry.lock().reset();
                Counters::bump(&self.counters.state_resets);
            }
        }
        evaluation.events
    }

    /// Evaluate a batch of sealed windows in parallel across prefixes. Windows of the same
    /// prefix are evaluated one after the other, in bucket order.
    pub fn evaluate_batch(&self, jobs: Vec<SealedJob>) -> Vec<AnomalyEvent> {
        let mut groups: BTreeMap<Prefix, Vec<SealedJob>> = BTreeMap::new();
        for job in jobs {
            groups.entry(job.prefix()).or_default().push(job);
        }
        groups
            .into_par_iter()
            .map(|(_, mut jobs)| {
                jobs.sort_by_key(|j| j.bucket());
                jobs.iter()
                    .flat_map(|j| self.evaluate_job(j))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }
}

/// All stages driven synchronously: every call to [`Engine::ingest`] returns the events of the
/// windows that were sealed by it.
#[derive(Debug)]
pub struct Engine {
    index: Arc<PrefixIndex>,
    counters: Arc<Counters>,
    windows: WindowManager,
    evaluator: Evaluator,
    dedup: Deduplicator,
}

impl Engine {
    /// Create a new engine. Fails if the configuration is invalid.
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let index = Arc::new(PrefixIndex::new());
        let counters = Arc::new(Counters::new());
        let windows = WindowManager::new(
            index.clone(),
            Arc::new(Watermark::new()),
            counters.clone(),
            config.bucket(),
            config.lateness(),
            config.flap_interval(),
            config.ignore_prepending,
        );
        let evaluator = Evaluator::from_config(&config, index.clone(), counters.clone());
        Ok(Self {
            index,
            counters,
            windows,
            evaluator,
            dedup: Deduplicator::new(config.dedup_retention_buckets),
        })
    }

    /// Validate and ingest a raw update.
    pub fn ingest(&mut self, raw: &RawUpdate) -> Result<Vec<AnomalyEvent>, ValidationError> {
        match normalize(raw) {
            Ok(update) => Ok(self.ingest_record(update)),
            Err(e) => {
                log::warn!("Dropping update from {}: {e}", raw.collector);
                Counters::bump(&self.counters.validation_errors);
                Err(e)
            }
        }
    }

    /// Ingest an already validated update.
    pub fn ingest_record(&mut self, update: UpdateRecord) -> Vec<AnomalyEvent> {
        self.windows.route(update);
        let jobs = self.windows.sweep();
        self.evaluate(jobs)
    }

    /// Seal all open windows and evaluate them.
    pub fn flush(&mut self) -> Vec<AnomalyEvent> {
        let jobs = self.windows.flush();
        self.evaluate(jobs)
    }

    fn evaluate(&mut self, jobs: Vec<SealedJob>) -> Vec<AnomalyEvent> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let mut events = self.evaluator.evaluate_batch(jobs);
        events.retain(|e| {
            let fresh = self.dedup.insert(e.dedup_key());
            if !fresh {
                Counters::bump(&self.counters.duplicates_suppressed);
            }
            fresh
        });
        Counters::add(&self.counters.events_emitted, events.len() as u64);
        events
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn index(&self) -> &PrefixIndex {
        &self.index
    }

    pub fn late(&self) -> &LateBucket {
        self.windows.late()
    }
}
