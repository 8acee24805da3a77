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
//! Event emitter: deduplicates anomaly events, turns them into records, and hands them to the
//! persistence layer through a bounded queue.
//!
//! The queue is drained by a dedicated task that writes into an [`EventSink`]. If the sink falls
//! behind and the queue is full, the configured [`BackpressurePolicy`] decides: either the oldest
//! pending record is evicted, or the submitter waits for room up to a timeout and the new record
//! is dropped afterwards. In both cases the detectors never stall indefinitely.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Notify,
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::{BackpressurePolicy, EmitterConfig},
    event::{AnomalyEvent, DedupKey},
    records::AnalysisRecord,
    stats::Counters,
    Bucket,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot serialize the record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum EmitError {
    /// The persistence layer is saturated. The event was dropped and counted.
    #[error("Event queue still full after {0:?}, dropped the event")]
    Backpressure(Duration),
    #[error("The emitter is closed")]
    Closed,
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Cannot join the drain task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Destination of analysis records.
#[async_trait]
pub trait EventSink: Send {
    async fn persist(&mut self, record: AnalysisRecord) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that keeps all records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<AnalysisRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AnalysisRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of all records persisted so far.
    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn persist(&mut self, record: AnalysisRecord) -> Result<(), SinkError> {
        self.lock().push(record);
        Ok(())
    }
}

/// Sink writing one JSON object per line, tagged with its destination table.
pub struct JsonLinesSink {
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Create (or truncate) the file at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Ok(Self::new(tokio::fs::File::create(path).await?))
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    async fn persist(&mut self, record: AnalysisRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Remembers the identity of emitted events for a bounded number of recent buckets.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<DedupKey>,
    by_bucket: BTreeMap<Bucket, Vec<DedupKey>>,
    retention: u64,
}

impl Deduplicator {
    pub fn new(retention_buckets: u64) -> Self {
        Self {
            retention: retention_buckets.max(1),
            ..Default::default()
        }
    }

    /// Returns `true` if the key was not seen before, and remembers it.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.by_bucket.entry(key.bucket).or_default().push(key);
        self.evict();
        true
    }

    fn evict(&mut self) {
        let Some(newest) = self.by_bucket.keys().next_back().copied() else {
            return;
        };
        let horizon = newest.saturating_sub(self.retention as i64);
        while let Some(entry) = self.by_bucket.first_entry() {
            if *entry.key() > horizon {
                break;
            }
            for key in entry.remove() {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Default)]
struct Queue {
    records: VecDeque<AnalysisRecord>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    not_empty: Notify,
    not_full: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the emitter. Submitting is safe from any number of tasks.
#[derive(Debug)]
pub struct Emitter {
    shared: Arc<Shared>,
    dedup: Mutex<Deduplicator>,
    config: EmitterConfig,
    counters: Arc<Counters>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Emitter {
    /// Start the drain task on the current tokio runtime.
    pub fn spawn(
        config: EmitterConfig,
        dedup_retention: u64,
        sink: Box<dyn EventSink>,
        counters: Arc<Counters>,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let drain = tokio::spawn(drain(shared.clone(), sink, counters.clone()));
        Self {
            shared,
            dedup: Mutex::new(Deduplicator::new(dedup_retention)),
            config,
            counters,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Number of records waiting to be persisted.
    pub fn pending(&self) -> usize {
        self.shared.lock().records.len()
    }

    /// Submit an event. Returns `Ok(false)` for a duplicate, which is suppressed.
    pub async fn submit(&self, event: AnomalyEvent) -> Result<bool, EmitError> {
        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.dedup_key());
        if !fresh {
            log::debug!("Suppressed duplicate {} for {}", event.kind(), event.prefix());
            Counters::bump(&self.counters.duplicates_suppressed);
            return Ok(false);
        }
        let record = event.into_record(Utc::now());
        let pushed = match self.config.policy {
            BackpressurePolicy::DropOldest => self.push_drop_oldest(record),
            BackpressurePolicy::BlockWithTimeout { timeout_ms } => {
                self.push_blocking(record, Duration::from_millis(timeout_ms))
                    .await
            }
        };
        pushed.map(|_| true)
    }

    fn push_drop_oldest(&self, record: AnalysisRecord) -> Result<(), EmitError> {
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(EmitError::Closed);
        }
        while queue.records.len() >= self.config.capacity {
            if let Some(old) = queue.records.pop_front() {
                log::warn!(
                    "Event queue full, dropped the oldest record ({} for {})",
                    old.table(),
                    old.prefix()
                );
                Counters::bump(&self.counters.events_dropped);
            }
        }
        queue.records.push_back(record);
        drop(queue);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    async fn push_blocking(&self, record: AnalysisRecord, timeout: Duration) -> Result<(), EmitError> {
        let deadline = Instant::now() + timeout;
        let mut record = Some(record);
        loop {
            {
                let mut queue = self.shared.lock();
                if queue.closed {
                    return Err(EmitError::Closed);
                }
                if queue.records.len() < self.config.capacity {
                    queue.records.extend(record.take());
                    drop(queue);
                    self.shared.not_empty.notify_one();
                    return Ok(());
                }
            }
            // the drain task stores a permit on every pop, so no wakeup is lost in between
            if tokio::time::timeout_at(deadline, self.shared.not_full.notified())
                .await
                .is_err()
            {
                log::warn!("Event queue full for {timeout:?}, dropping the new record");
                Counters::bump(&self.counters.events_dropped);
                return Err(EmitError::Backpressure(timeout));
            }
        }
    }

    /// Stop accepting events, persist everything pending, and flush the sink.
    pub async fn close(&self) -> Result<(), EmitError> {
        self.shared.lock().closed = true;
        self.shared.not_empty.notify_one();
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

async fn drain(shared: Arc<Shared>, mut sink: Box<dyn EventSink>, counters: Arc<Counters>) {
    loop {
        let (next, closed) = {
            let mut queue = shared.lock();
            (queue.records.pop_front(), queue.closed)
        };
        match next {
            Some(record) => {
                shared.not_full.notify_one();
                let table = record.table();
                match sink.persist(record).await {
                    Ok(()) => Counters::bump(&counters.events_emitted),
                    Err(e) => {
                        log::error!("Cannot persist a record into {table}: {e}");
                        Counters::bump(&counters.sink_failures);
                    }
                }
            }
            None if closed => break,
            None => shared.not_empty.notified().await,
        }
    }
    if let Err(e) = sink.flush().await {
        log::error!("Cannot flush the sink: {e}");
        Counters::bump(&counters.sink_failures);
    }
}
