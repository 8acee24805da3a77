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
use std::collections::HashSet;

use rand::{seq::SliceRandom, thread_rng};

use super::*;
use crate::{
    emitter::MemorySink, pipeline::Pipeline, records::AnalysisRecord, source::SourceError,
};

fn prefix(i: usize) -> String {
    format!("10.{}.{}.0/24", i / 256, i % 256)
}

/// Updates of one collector, all within the first window: every prefix is announced by AS100
/// from two peers, and every fifth prefix also by AS300 from two other peers.
fn collector_updates(collector: &str, peers: [u8; 2], num_prefixes: usize) -> Vec<RawUpdate> {
    let mut updates = Vec::new();
    for i in 0..num_prefixes {
        let origin = match peers[0] {
            1 => 100,
            _ if i % 5 == 0 => 300,
            _ => continue,
        };
        for (k, peer) in peers.into_iter().enumerate() {
            updates.push(RawUpdate {
                collector: collector.to_string(),
                ..announce((i % 200) as f64 + k as f64 * 0.5, peer, &prefix(i), &[3356, origin])
            });
        }
    }
    updates
}

fn pipeline_config() -> DetectorConfig {
    DetectorConfig {
        num_shards: 4,
        channel_capacity: 16,
        // no update can be late, whatever the interleaving of the collectors
        lateness_secs: 900,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_collectors() {
    let sink = MemorySink::new();
    let mut pipeline = Pipeline::start(pipeline_config(), Box::new(sink.clone())).unwrap();

    let mut rng = thread_rng();
    let mut total = 0;
    for (collector, peers) in [("rrc00", [1, 2]), ("rrc01", [3, 4])] {
        let mut updates = collector_updates(collector, peers, 100);
        updates.shuffle(&mut rng);
        total += updates.len();
        pipeline.spawn_source(collector, updates.into_iter().map(Ok));
    }
    pipeline.wait_for_sources().await;
    let counters = pipeline.shutdown().await.unwrap();

    assert_eq!(counters.updates, total as u64);
    assert_eq!(counters.late_updates, 0);
    assert_eq!(counters.state_resets, 0);
    assert_eq!(counters.windows_sealed, 100);
    assert_eq!(counters.windows_archived, 100);

    let records = sink.records();
    let moas: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            AnalysisRecord::Hijack(h) if h.event_type == "MOAS" => Some(h.prefix),
            _ => None,
        })
        .collect();
    assert_eq!(moas.len(), 20);
    let unique: HashSet<_> = moas.iter().collect();
    assert_eq!(unique.len(), moas.len());
    assert!(moas
        .iter()
        .all(|p| (0..100).step_by(5).any(|i| prefix(i) == p.to_string())));
    assert_eq!(counters.events_emitted, records.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn origin_hijack_across_windows() {
    let sink = MemorySink::new();
    let mut pipeline = Pipeline::start(pipeline_config(), Box::new(sink.clone())).unwrap();

    let p = "192.0.2.0/24";
    let mut updates = Vec::new();
    for bucket in 0..2 {
        let t = bucket as f64 * 300.0;
        updates.push(announce(t + 1.0, 1, p, &[3356, 100]));
        updates.push(announce(t + 2.0, 2, p, &[1299, 100]));
    }
    updates.extend((0..8).map(|i| announce(601.0 + i as f64, 1 + i % 4, p, &[3356, 100])));
    updates.push(announce(650.0, 5, p, &[174, 200]));
    updates.push(announce(651.0, 6, p, &[6939, 200]));
    // rejected by the normalizer and counted
    updates.push(announce(652.0, 7, "192.0.2.0", &[174, 200]));

    pipeline.spawn_source("rrc00", updates.into_iter().map(Ok));
    pipeline.wait_for_sources().await;
    let counters = pipeline.shutdown().await.unwrap();
    assert_eq!(counters.validation_errors, 1);

    let hijacks: Vec<_> = sink
        .records()
        .into_iter()
        .filter_map(|r| match r {
            AnalysisRecord::Hijack(h) if h.event_type == "ORIGIN" => Some(h),
            _ => None,
        })
        .collect();
    assert_eq!(hijacks.len(), 1);
    assert_eq!(hijacks[0].baseline_origin, Some(100));
    assert_eq!(hijacks[0].top_origin, Some(200));
    assert_eq!(hijacks[0].top_ratio, Some(0.2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_through_ingestor() {
    let sink = MemorySink::new();
    let pipeline = Pipeline::start(pipeline_config(), Box::new(sink.clone())).unwrap();
    let ingestor = pipeline.ingestor();

    let tasks: Vec<_> = (1..=4u8)
        .map(|peer| {
            let ingestor = ingestor.clone();
            tokio::spawn(async move {
                let origin = if peer <= 2 { 100 } else { 300 };
                ingestor
                    .submit(&announce(peer as f64, peer, "203.0.113.0/24", &[3356, origin]))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(matches!(
        ingestor
            .submit(&announce(5.0, 5, "203.0.113.0/24", &[0]))
            .await,
        Err(crate::pipeline::IngestError::Invalid(_))
    ));

    pipeline.shutdown().await.unwrap();
    assert!(ingestor
        .submit(&announce(6.0, 1, "203.0.113.0/24", &[3356, 100]))
        .await
        .is_err());
    assert_eq!(sink.len(), 1);
}

/// Number of prefixes of the shuffled stream: `10.42.0.0/16` and 16 of its more specifics.
const NESTED: usize = 17;

fn nested_prefix(i: usize) -> String {
    match i {
        0 => "10.42.0.0/16".to_string(),
        i => format!("10.42.{i}.0/24"),
    }
}

/// Four collectors reporting a stable origin for all nested prefixes over `buckets` buckets,
/// one update every half second. Updates are shuffled in chunks that never cross a bucket
/// boundary.
fn shuffled_stream(buckets: usize) -> Vec<RawUpdate> {
    let per_bucket = 600;
    let collectors = ["rrc00", "rrc01", "route-views2", "route-views6"];
    let mut updates: Vec<RawUpdate> = (0..buckets * per_bucket)
        .map(|j| {
            let c = j % collectors.len();
            RawUpdate {
                collector: collectors[c].to_string(),
                ..announce(j as f64 * 0.5, 1 + c as u8, &nested_prefix(j % NESTED), &[3356, 100])
            }
        })
        .collect();
    let mut rng = thread_rng();
    for chunk in updates.chunks_mut(8) {
        chunk.shuffle(&mut rng);
    }
    updates
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shuffled_collectors_across_buckets() {
    let buckets = 6;
    let updates = shuffled_stream(buckets);
    let expected: HashSet<(String, i64)> = updates
        .iter()
        .map(|u| (u.prefix.clone(), ((u.received_at - T0) / 300.0).floor() as i64))
        .collect();
    assert_eq!(expected.len(), NESTED * buckets);

    let sink = MemorySink::new();
    let config = DetectorConfig {
        num_shards: 4,
        channel_capacity: 2,
        lateness_secs: 60,
        ..Default::default()
    };
    let mut pipeline = Pipeline::start(config, Box::new(sink.clone())).unwrap();
    let index = pipeline.index();
    pipeline.spawn_source("merged", updates.clone().into_iter().map(Ok));
    pipeline.wait_for_sources().await;
    let counters = pipeline.shutdown().await.unwrap();

    assert_eq!(counters.updates, updates.len() as u64);
    assert_eq!(counters.late_updates, 0);
    assert_eq!(counters.state_resets, 0);
    assert_eq!(counters.windows_sealed, expected.len() as u64);
    assert_eq!(counters.windows_archived, counters.windows_sealed);
    assert_eq!(sink.len(), 0);

    assert_eq!(index.len(), NESTED);
    let mut sealed = HashSet::new();
    for entry in index.entries() {
        let state = entry.lock();
        assert!(state.open_window().is_none());
        assert_eq!(state.last_archived(), Some(buckets as i64 - 1));
        let closed: Vec<_> = state.closed_summaries().map(|s| s.bucket).collect();
        assert!(closed.windows(2).all(|w| w[0] < w[1]));
        for bucket in closed {
            assert!(sealed.insert((entry.prefix.to_string(), bucket)));
        }
    }
    assert_eq!(sealed, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_source_entries_are_counted() {
    let sink = MemorySink::new();
    let mut pipeline = Pipeline::start(pipeline_config(), Box::new(sink.clone())).unwrap();
    let entries = vec![
        Ok(announce(1.0, 1, "198.51.100.0/24", &[3356, 100])),
        Err(SourceError::UnknownFormat("routes.parquet".into())),
        Ok(announce(2.0, 2, "198.51.100.0/24", &[1299, 100])),
    ];
    pipeline.spawn_source("rrc00", entries);
    pipeline.wait_for_sources().await;
    let counters = pipeline.shutdown().await.unwrap();
    assert_eq!(counters.validation_errors, 1);
    assert_eq!(counters.updates, 2);
    assert_eq!(counters.windows_sealed, 1);
}
