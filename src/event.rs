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
//! Anomaly events raised by the detectors, and their conversion into [`AnalysisRecord`]s.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    records::{AnalysisRecord, FlapRecord, HijackRecord, LoopRecord, PeerId},
    window::{WindowBounds, WindowState},
    Asn, Bucket, Prefix,
};

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum_macros::EnumString,
)]
/// Kind of anomaly. The string form is the `event_type` of hijack records.
pub enum EventKind {
    #[serde(rename = "ORIGIN")]
    #[strum(serialize = "ORIGIN")]
    OriginHijack,
    #[serde(rename = "SUBPREFIX")]
    #[strum(serialize = "SUBPREFIX")]
    SubPrefixHijack,
    #[serde(rename = "MOAS")]
    #[strum(serialize = "MOAS")]
    Moas,
    #[serde(rename = "LOOP")]
    #[strum(serialize = "LOOP")]
    PathLoop,
    #[serde(rename = "FLAP")]
    #[strum(serialize = "FLAP")]
    Flap,
}

/// What was observed for a single origin within a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginEvidence {
    pub peers: Vec<PeerId>,
    pub events: u64,
    pub sample_as_paths: Vec<Vec<Asn>>,
}

/// Evidence of all origins of a window.
pub fn origin_evidence(window: &WindowState) -> BTreeMap<Asn, OriginEvidence> {
    window
        .origins
        .iter()
        .map(|(asn, stats)| {
            (
                *asn,
                OriginEvidence {
                    peers: stats.peers.iter().copied().collect(),
                    events: stats.count,
                    sample_as_paths: stats.sample_paths.clone(),
                },
            )
        })
        .collect()
}

/// A window whose dominating origin differs from the baseline origin.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginHijack {
    pub prefix: Prefix,
    pub bounds: WindowBounds,
    pub baseline_origin: Asn,
    pub top_origin: Asn,
    pub top_ratio: f64,
    /// Peers that observed the top origin.
    pub distinct_peers: usize,
    pub total_events: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub per_origin: BTreeMap<Asn, OriginEvidence>,
}

/// A more-specific prefix originated by a different AS than its closest tracked parent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPrefixHijack {
    pub parent_prefix: Prefix,
    pub more_specific: Prefix,
    pub bounds: WindowBounds,
    /// Bucket of the parent's closed window used for the comparison.
    pub parent_bucket: Bucket,
    pub parent_origin: Asn,
    pub parent_origins: Vec<Asn>,
    pub child_origin: Asn,
    pub child_origins: Vec<Asn>,
    pub distinct_peers: usize,
    pub total_events: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Multiple origins, each corroborated by enough peers, within the same window.
#[derive(Debug, Clone, PartialEq)]
pub struct Moas {
    pub prefix: Prefix,
    pub bounds: WindowBounds,
    pub origins: Vec<Asn>,
    /// Peers that observed any of `origins`.
    pub distinct_peers: usize,
    pub total_events: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub per_origin: BTreeMap<Asn, OriginEvidence>,
}

/// An AS path in which an AS number appears twice, non-consecutively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLoop {
    pub prefix: Prefix,
    pub bounds: WindowBounds,
    pub time: DateTime<Utc>,
    pub peer: PeerId,
    pub repeat_as: Asn,
    pub first_idx: usize,
    pub second_idx: usize,
    pub as_path: Vec<Asn>,
}

/// The prefix alternated between announced and withdrawn too often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flap {
    pub prefix: Prefix,
    pub bounds: WindowBounds,
    pub total_events: u64,
    pub flap_count: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyEvent {
    OriginHijack(OriginHijack),
    SubPrefixHijack(SubPrefixHijack),
    Moas(Moas),
    PathLoop(PathLoop),
    Flap(Flap),
}

/// Identity of an event for deduplication: at most one event per prefix, kind, and window.
/// Loops are further distinguished by the repeated AS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey {
    pub prefix: Prefix,
    pub kind: EventKind,
    pub bucket: Bucket,
    pub discriminator: Option<Asn>,
}

impl AnomalyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OriginHijack(_) => EventKind::OriginHijack,
            Self::SubPrefixHijack(_) => EventKind::SubPrefixHijack,
            Self::Moas(_) => EventKind::Moas,
            Self::PathLoop(_) => EventKind::PathLoop,
            Self::Flap(_) => EventKind::Flap,
        }
    }

    pub fn prefix(&self) -> Prefix {
        match self {
            Self::OriginHijack(e) => e.prefix,
            Self::SubPrefixHijack(e) => e.more_specific,
            Self::Moas(e) => e.prefix,
            Self::PathLoop(e) => e.prefix,
            Self::Flap(e) => e.prefix,
        }
    }

    pub fn bounds(&self) -> WindowBounds {
        match self {
            Self::OriginHijack(e) => e.bounds,
            Self::SubPrefixHijack(e) => e.bounds,
            Self::Moas(e) => e.bounds,
            Self::PathLoop(e) => e.bounds,
            Self::Flap(e) => e.bounds,
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.bounds().bucket
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            prefix: self.prefix(),
            kind: self.kind(),
            bucket: self.bucket(),
            discriminator: match self {
                Self::PathLoop(e) => Some(e.repeat_as),
                _ => None,
            },
        }
    }

    /// Single-line human-readable description.
    pub fn summary(&self) -> String {
        match self {
            Self::OriginHijack(e) => format!(
                "[{} ~ {}] Origin change for {} | baseline={} → new={} ({}% window share) | peers={} | events={}",
                e.first_update.format(TIME_FMT),
                e.last_update.format(TIME_FMT),
                e.prefix,
                e.baseline_origin,
                e.top_origin,
                (e.top_ratio * 100.0).round() as u32,
                e.distinct_peers,
                e.total_events,
            ),
            Self::SubPrefixHijack(e) => format!(
                "[{} ~ {}] Subprefix hijack: {} (origins={:?}) under {} (origins={:?})",
                e.first_update.format(TIME_FMT),
                e.last_update.format(TIME_FMT),
                e.more_specific,
                e.child_origins,
                e.parent_prefix,
                e.parent_origins,
            ),
            Self::Moas(e) => format!(
                "[{} ~ {}] MOAS for {} | origins={:?} | peers={} | events={}",
                e.first_update.format(TIME_FMT),
                e.last_update.format(TIME_FMT),
                e.prefix,
                e.origins,
                e.distinct_peers,
                e.total_events,
            ),
            Self::PathLoop(e) => format!(
                "[{}] BGP loop for {} | peer_as={} | repeat_as={} (pos {}→{}) | as_path=[{}]",
                e.time.format(TIME_FMT),
                e.prefix,
                e.peer.peer_asn,
                e.repeat_as,
                e.first_idx,
                e.second_idx,
                e.as_path.iter().join(" "),
            ),
            Self::Flap(e) => format!(
                "[{} ~ {}] Flap for {} | total updates={} | flap (rapid A/W) count={}",
                e.first_update.format(TIME_FMT),
                e.last_update.format(TIME_FMT),
                e.prefix,
                e.total_events,
                e.flap_count,
            ),
        }
    }

    /// Build the record to persist.
    pub fn into_record(self, analyzed_at: DateTime<Utc>) -> AnalysisRecord {
        let summary = self.summary();
        match self {
            Self::OriginHijack(e) => AnalysisRecord::Hijack(HijackRecord {
                time: e.first_update,
                prefix: e.prefix,
                event_type: EventKind::OriginHijack.to_string(),
                origin_asns: vec![e.top_origin],
                distinct_peers: e.distinct_peers,
                total_events: e.total_events,
                first_update: e.first_update,
                last_update: e.last_update,
                baseline_origin: Some(e.baseline_origin),
                top_origin: Some(e.top_origin),
                top_ratio: Some(round(e.top_ratio, 6)),
                parent_prefix: None,
                more_specific: None,
                evidence: json!({
                    "window": {"start": e.first_update, "end": e.last_update},
                    "bucket_time": e.bounds.start,
                    "baseline_origin": e.baseline_origin,
                    "top_origin": e.top_origin,
                    "top_ratio": round(e.top_ratio, 3),
                    "per_origin": e.per_origin,
                }),
                summary,
                analyzed_at,
            }),
            Self::SubPrefixHijack(e) => AnalysisRecord::Hijack(HijackRecord {
                time: e.bounds.start,
                prefix: e.more_specific,
                event_type: EventKind::SubPrefixHijack.to_string(),
                origin_asns: e.child_origins.clone(),
                distinct_peers: e.distinct_peers,
                total_events: e.total_events,
                first_update: e.first_update,
                last_update: e.last_update,
                baseline_origin: None,
                top_origin: None,
                top_ratio: None,
                parent_prefix: Some(e.parent_prefix),
                more_specific: Some(e.more_specific),
                evidence: json!({
                    "bucket_time": e.bounds.start,
                    "super_prefix": e.parent_prefix,
                    "super_origins": e.parent_origins,
                    "super_top_origin": e.parent_origin,
                    "super_bucket": e.parent_bucket,
                    "sub_prefix": e.more_specific,
                    "sub_origins": e.child_origins,
                    "sub_top_origin": e.child_origin,
                }),
                summary,
                analyzed_at,
            }),
            Self::Moas(e) => AnalysisRecord::Hijack(HijackRecord {
                time: e.bounds.start,
                prefix: e.prefix,
                event_type: EventKind::Moas.to_string(),
                origin_asns: e.origins.clone(),
                distinct_peers: e.distinct_peers,
                total_events: e.total_events,
                first_update: e.first_update,
                last_update: e.last_update,
                baseline_origin: None,
                top_origin: None,
                top_ratio: None,
                parent_prefix: None,
                more_specific: None,
                evidence: json!({
                    "bucket_time": e.bounds.start,
                    "per_origin": e.per_origin,
                }),
                summary,
                analyzed_at,
            }),
            Self::PathLoop(e) => AnalysisRecord::Loop(LoopRecord {
                time: e.time,
                prefix: e.prefix,
                peer_as: e.peer.peer_asn,
                repeat_as: e.repeat_as,
                first_idx: e.first_idx,
                second_idx: e.second_idx,
                path_len: e.as_path.len(),
                as_path: e.as_path,
                summary,
                analyzed_at,
            }),
            Self::Flap(e) => AnalysisRecord::Flap(FlapRecord {
                time: e.bounds.start,
                prefix: e.prefix,
                total_events: e.total_events,
                flap_count: e.flap_count,
                first_update: e.first_update,
                last_update: e.last_update,
                summary,
                analyzed_at,
            }),
        }
    }
}

fn round(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}
