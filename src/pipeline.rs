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
//! Sharded pipeline on the tokio runtime.
//!
//! Every prefix is owned by exactly one shard task (see [`shard_of`]), which serializes all
//! window mutations of that prefix. Sealed windows are sent to a single evaluation task in FIFO
//! order, which runs the detectors with rayon across prefixes and submits the events to the
//! [`Emitter`]. Shards never wait for the evaluation. A window whose covering parent lives in
//! another shard and still has an open window at or before the same bucket is deferred until
//! that parent window is sealed.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{spawn_blocking, JoinHandle},
};

use crate::{
    config::{ConfigError, DetectorConfig},
    emitter::{EmitError, Emitter, EventSink},
    engine::Evaluator,
    event::AnomalyEvent,
    normalizer::{normalize, ValidationError},
    prefix_index::PrefixIndex,
    records::{RawUpdate, UpdateRecord},
    source::SourceError,
    stats::{CounterSnapshot, Counters},
    util::shard_of,
    window::{SealedJob, Watermark, WindowManager},
    Prefix,
};

/// Period at which idle shards check whether the global watermark sealed any of their windows.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid update: {0}")]
    Invalid(#[from] ValidationError),
    #[error("The pipeline is shut down")]
    Closed,
}

#[derive(Debug)]
enum ShardMsg {
    Update(UpdateRecord),
    Flush,
}

#[derive(Debug)]
enum EvalMsg {
    Sealed(Vec<SealedJob>),
    /// Last message of a shard, carrying all windows force-sealed on shutdown.
    Flushed(Vec<SealedJob>),
}

/// Cloneable handle for feeding updates into the pipeline.
#[derive(Debug, Clone)]
pub struct Ingestor {
    shards: Arc<Vec<mpsc::Sender<ShardMsg>>>,
    counters: Arc<Counters>,
}

impl Ingestor {
    fn validate(&self, raw: &RawUpdate) -> Result<UpdateRecord, IngestError> {
        normalize(raw).map_err(|e| {
            log::warn!("Dropping update from {}: {e}", raw.collector);
            Counters::bump(&self.counters.validation_errors);
            IngestError::Invalid(e)
        })
    }

    fn sender(&self, update: &UpdateRecord) -> &mpsc::Sender<ShardMsg> {
        &self.shards[shard_of(&update.prefix, self.shards.len())]
    }

    /// Validate an update and send it to its shard, waiting if the shard's channel is full.
    pub async fn submit(&self, raw: &RawUpdate) -> Result<(), IngestError> {
        let update = self.validate(raw)?;
        self.submit_record(update).await
    }

    pub async fn submit_record(&self, update: UpdateRecord) -> Result<(), IngestError> {
        self.sender(&update)
            .send(ShardMsg::Update(update))
            .await
            .map_err(|_| IngestError::Closed)
    }

    /// Same as [`Ingestor::submit`], for use outside of the async runtime.
    pub fn blocking_submit(&self, raw: &RawUpdate) -> Result<(), IngestError> {
        let update = self.validate(raw)?;
        self.sender(&update)
            .blocking_send(ShardMsg::Update(update))
            .map_err(|_| IngestError::Closed)
    }
}

/// Running pipeline. Must be started and shut down within a multi-threaded tokio runtime.
#[derive(Debug)]
pub struct Pipeline {
    ingestor: Ingestor,
    shards: Vec<JoinHandle<()>>,
    evaluation: JoinHandle<Result<(), EmitError>>,
    sources: Vec<(String, JoinHandle<u64>)>,
    stop: Arc<AtomicBool>,
    index: Arc<PrefixIndex>,
    counters: Arc<Counters>,
}

impl Pipeline {
    /// Validate the configuration and spawn all shards, the evaluation task and the emitter.
    pub fn start(config: DetectorConfig, sink: Box<dyn EventSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let index = Arc::new(PrefixIndex::new());
        let counters = Arc::new(Counters::new());
        let watermark = Arc::new(Watermark::new());
        let (eval_tx, eval_rx) = mpsc::unbounded_channel();

        let mut senders = Vec::with_capacity(config.num_shards);
        let mut shards = Vec::with_capacity(config.num_shards);
        for id in 0..config.num_shards {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let windows = WindowManager::new(
                index.clone(),
                watermark.clone(),
                counters.clone(),
                config.bucket(),
                config.lateness(),
                config.flap_interval(),
                config.ignore_prepending,
            );
            senders.push(tx);
            shards.push(tokio::spawn(run_shard(id, rx, windows, eval_tx.clone())));
        }
        drop(eval_tx);

        let evaluator = Arc::new(Evaluator::from_config(
            &config,
            index.clone(),
            counters.clone(),
        ));
        let emitter = Emitter::spawn(
            config.emitter.clone(),
            config.dedup_retention_buckets,
            sink,
            counters.clone(),
        );
        let evaluation = tokio::spawn(run_evaluation(
            eval_rx,
            evaluator,
            emitter,
            index.clone(),
            config.num_shards,
        ));

        log::info!(
            "Started the pipeline with {} shards ({}s buckets, {}s lateness)",
            config.num_shards,
            config.bucket_secs,
            config.lateness_secs
        );

        Ok(Self {
            ingestor: Ingestor {
                shards: Arc::new(senders),
                counters: counters.clone(),
            },
            shards,
            evaluation,
            sources: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            index,
            counters,
        })
    }

    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub fn index(&self) -> Arc<PrefixIndex> {
        self.index.clone()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Feed all updates of a collector stream on a blocking worker thread. Unreadable entries are
    /// logged, counted as validation errors and skipped. The source stops early on shutdown.
    pub fn spawn_source<I>(&mut self, collector: impl Into<String>, updates: I)
    where
        I: IntoIterator<Item = Result<RawUpdate, SourceError>>,
        I::IntoIter: Send + 'static,
    {
        let collector = collector.into();
        let ingestor = self.ingestor.clone();
        let counters = self.counters.clone();
        let stop = self.stop.clone();
        let name = collector.clone();
        let updates = updates.into_iter();
        let handle = spawn_blocking(move || {
            let mut submitted = 0;
            for update in updates {
                if stop.load(Ordering::Relaxed) {
                    log::info!("Stopping source {name}");
                    break;
                }
                let raw = match update {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::warn!("Skipping an entry of {name}: {e}");
                        Counters::bump(&counters.validation_errors);
                        continue;
                    }
                };
                match ingestor.blocking_submit(&raw) {
                    Ok(()) => submitted += 1,
                    Err(IngestError::Invalid(_)) => {}
                    Err(IngestError::Closed) => break,
                }
            }
            submitted
        });
        log::info!("Started source {collector}");
        self.sources.push((collector, handle));
    }

    /// Wait until all sources are exhausted. Cancel-safe: sources not yet finished stay
    /// registered.
    pub async fn wait_for_sources(&mut self) {
        while let Some((collector, handle)) = self.sources.last_mut() {
            match handle.await {
                Ok(n) => log::info!("Source {collector} finished after {n} updates"),
                Err(e) => log::error!("Source {collector} failed: {e}"),
            }
            self.sources.pop();
        }
    }

    /// Stop all sources, drain the shards, force-seal all windows, evaluate them and flush the
    /// emitter. Returns the final counters.
    pub async fn shutdown(mut self) -> Result<CounterSnapshot, EmitError> {
        log::info!("Shutting down the pipeline");
        self.stop.store(true, Ordering::Relaxed);
        self.wait_for_sources().await;

        for shard in self.ingestor.shards.iter() {
            // a closed shard has nothing left to flush
            let _ = shard.send(ShardMsg::Flush).await;
        }
        for shard in self.shards {
            shard.await?;
        }
        self.evaluation.await??;

        let snapshot = self.counters.snapshot();
        log::info!("Pipeline stopped. {snapshot}");
        Ok(snapshot)
    }
}

async fn run_shard(
    id: usize,
    mut rx: mpsc::Receiver<ShardMsg>,
    mut windows: WindowManager,
    eval_tx: mpsc::UnboundedSender<EvalMsg>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    let send = |jobs: Vec<SealedJob>| {
        if !jobs.is_empty() && eval_tx.send(EvalMsg::Sealed(jobs)).is_err() {
            log::error!("Shard {id}: the evaluation task is gone");
        }
    };
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ShardMsg::Update(update)) => {
                    windows.route(update);
                    send(windows.sweep());
                }
                Some(ShardMsg::Flush) | None => break,
            },
            _ = ticker.tick() => send(windows.sweep()),
        }
    }
    let jobs = windows.flush();
    log::debug!("Shard {id} flushed {} windows", jobs.len());
    if eval_tx.send(EvalMsg::Flushed(jobs)).is_err() {
        log::error!("Shard {id}: the evaluation task is gone");
    }
}

/// Sealed windows waiting for the windows of their covering parent to be sealed.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    jobs: Vec<SealedJob>,
}

impl Deferred {
    /// Merge `incoming` with the deferred jobs and return those ready for evaluation. A job is
    /// ready once its nearest covering parent has no open window at or before the job's bucket.
    /// Later windows of a deferred prefix stay deferred, as windows of one prefix are archived in
    /// order.
    pub(crate) fn ready(&mut self, index: &PrefixIndex, incoming: Vec<SealedJob>) -> Vec<SealedJob> {
        let mut jobs = std::mem::take(&mut self.jobs);
        jobs.extend(incoming);
        jobs.sort_by_key(|j| (j.bucket(), j.prefix()));

        let mut blocked: HashSet<Prefix> = HashSet::new();
        let mut ready = Vec::with_capacity(jobs.len());
        for job in jobs {
            if blocked.contains(&job.prefix()) || parent_open(index, &job) {
                log::trace!("Deferring {} bucket {}", job.prefix(), job.bucket());
                blocked.insert(job.prefix());
                self.jobs.push(job);
            } else {
                ready.push(job);
            }
        }
        ready
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Release all deferred jobs, once every window is sealed.
    fn drain(&mut self) -> Vec<SealedJob> {
        std::mem::take(&mut self.jobs)
    }
}

fn parent_open(index: &PrefixIndex, job: &SealedJob) -> bool {
    index
        .longest_covering_parent(&job.prefix())
        .and_then(|parent| parent.lock().open_bucket())
        .is_some_and(|open| open <= job.bucket())
}

async fn run_evaluation(
    mut rx: mpsc::UnboundedReceiver<EvalMsg>,
    evaluator: Arc<Evaluator>,
    emitter: Emitter,
    index: Arc<PrefixIndex>,
    num_shards: usize,
) -> Result<(), EmitError> {
    let mut deferred = Deferred::default();
    let mut flushed = Vec::new();
    let mut remaining = num_shards;
    while remaining > 0 {
        match rx.recv().await {
            Some(EvalMsg::Sealed(jobs)) => {
                let jobs = deferred.ready(&index, jobs);
                let events = evaluate(&evaluator, jobs).await?;
                submit_all(&emitter, events).await?;
            }
            Some(EvalMsg::Flushed(jobs)) => {
                flushed.extend(jobs);
                remaining -= 1;
            }
            None => break,
        }
    }
    // all shards are sealed before the final evaluation, such that the last window of every
    // parent prefix is summarized before its more specifics are compared against it
    log::debug!("Releasing {} deferred windows", deferred.len());
    flushed.extend(deferred.drain());
    flushed.sort_by_key(|j| (j.bucket(), j.prefix()));
    let events = evaluate(&evaluator, flushed).await?;
    submit_all(&emitter, events).await?;
    emitter.close().await
}

async fn evaluate(
    evaluator: &Arc<Evaluator>,
    jobs: Vec<SealedJob>,
) -> Result<Vec<AnomalyEvent>, EmitError> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let evaluator = evaluator.clone();
    Ok(spawn_blocking(move || evaluator.evaluate_batch(jobs)).await?)
}

async fn submit_all(emitter: &Emitter, events: Vec<AnomalyEvent>) -> Result<(), EmitError> {
    for event in events {
        match emitter.submit(event).await {
            Ok(_) | Err(EmitError::Backpressure(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use chrono::DateTime;

    use super::*;
    use crate::{state::PrefixEntry, window::WindowBounds, Bucket};

    const BUCKET_MS: i64 = 300_000;

    fn open(entry: &PrefixEntry, bucket: Bucket) {
        let first = DateTime::from_timestamp(bucket * 300, 0).unwrap();
        entry
            .lock()
            .open(WindowBounds::new(bucket, BUCKET_MS), first)
            .unwrap();
    }

    fn seal(entry: &Arc<PrefixEntry>) -> SealedJob {
        let window = entry.lock().seal().unwrap();
        SealedJob {
            entry: entry.clone(),
            window,
        }
    }

    fn buckets(jobs: &[SealedJob]) -> Vec<(Bucket, String)> {
        jobs.iter()
            .map(|j| (j.bucket(), j.prefix().to_string()))
            .collect()
    }

    #[test]
    fn children_wait_for_their_parent() {
        let index = PrefixIndex::new();
        let parent = index.insert("10.0.0.0/8".parse().unwrap());
        let child = index.insert("10.1.0.0/16".parse().unwrap());
        let other = index.insert("192.0.2.0/24".parse().unwrap());

        open(&parent, 0);
        open(&child, 0);
        let child_0 = seal(&child);
        open(&child, 1);
        let child_1 = seal(&child);
        open(&other, 0);
        let other_0 = seal(&other);

        let mut deferred = Deferred::default();
        let ready = deferred.ready(&index, vec![child_1, other_0, child_0]);
        assert_eq!(buckets(&ready), vec![(0, "192.0.2.0/24".to_string())]);
        assert_eq!(deferred.len(), 2);

        let parent_0 = seal(&parent);
        open(&parent, 1);
        // the parent window of bucket 1 is still open
        let ready = deferred.ready(&index, vec![parent_0]);
        assert_eq!(
            buckets(&ready),
            vec![(0, "10.0.0.0/8".to_string()), (0, "10.1.0.0/16".to_string())]
        );
        assert_eq!(deferred.len(), 1);

        let parent_1 = seal(&parent);
        let ready = deferred.ready(&index, vec![parent_1]);
        assert_eq!(
            buckets(&ready),
            vec![(1, "10.0.0.0/8".to_string()), (1, "10.1.0.0/16".to_string())]
        );
        assert_eq!(deferred.len(), 0);
    }

    #[test]
    fn parent_ahead_releases_child() {
        let index = PrefixIndex::new();
        let parent = index.insert("10.0.0.0/8".parse().unwrap());
        let child = index.insert("10.1.0.0/16".parse().unwrap());
        open(&child, 0);
        let child_0 = seal(&child);
        open(&parent, 1);

        let mut deferred = Deferred::default();
        assert_eq!(deferred.ready(&index, vec![child_0]).len(), 1);
        assert_eq!(deferred.drain().len(), 0);
    }
}
