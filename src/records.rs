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
//! Module defining record data types: updates as received from the collectors, updates after
//! validation, and the analysis records handed to the persistence layer.
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Asn, Prefix};

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
    strum_macros::EnumString,
)]
/// Whether an update announces or withdraws a prefix.
pub enum UpdateKind {
    #[serde(rename = "announcement", alias = "announce", alias = "A")]
    #[strum(to_string = "announcement", serialize = "announce", serialize = "A")]
    Announce,
    #[serde(rename = "withdrawal", alias = "withdraw", alias = "W")]
    #[strum(to_string = "withdrawal", serialize = "withdraw", serialize = "W")]
    Withdraw,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
/// Decoded update as shipped by a route collector, before any validation.
pub struct RawUpdate {
    /// Seconds since the UNIX epoch.
    #[serde(with = "sentry_utils::serde::epoch_secs", alias = "timestamp")]
    pub received_at: f64,
    pub collector: String,
    pub peer_asn: Asn,
    pub peer_address: String,
    pub prefix: String,
    #[serde(default, with = "sentry_utils::serde::as_path")]
    pub as_path: Vec<Asn>,
    #[serde(default)]
    pub next_hop: Option<String>,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
}

/// Identity of a BGP session at a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub peer_asn: Asn,
    pub peer_address: IpAddr,
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AS{} ({})", self.peer_asn, self.peer_address)
    }
}

/// Validated, canonical update. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub timestamp: DateTime<Utc>,
    pub collector: String,
    pub peer: PeerId,
    /// Prefix in canonical network form (host bits cleared).
    pub prefix: Prefix,
    pub as_path: Vec<Asn>,
    pub next_hop: Option<IpAddr>,
    pub kind: UpdateKind,
}

impl UpdateRecord {
    /// The origin AS, i.e., the last AS of the path. `None` for withdrawals.
    pub fn origin(&self) -> Option<Asn> {
        match self.kind {
            UpdateKind::Announce => self.as_path.last().copied(),
            UpdateKind::Withdraw => None,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Row of the `hijack_events` table, shared by the `ORIGIN`, `SUBPREFIX`, and `MOAS` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HijackRecord {
    pub time: DateTime<Utc>,
    pub prefix: Prefix,
    pub event_type: String,
    pub origin_asns: Vec<Asn>,
    pub distinct_peers: usize,
    pub total_events: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub baseline_origin: Option<Asn>,
    pub top_origin: Option<Asn>,
    pub top_ratio: Option<f64>,
    pub parent_prefix: Option<Prefix>,
    pub more_specific: Option<Prefix>,
    pub evidence: serde_json::Value,
    pub summary: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Row of the `loop_analysis_results` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRecord {
    pub time: DateTime<Utc>,
    pub prefix: Prefix,
    pub peer_as: Asn,
    pub repeat_as: Asn,
    pub first_idx: usize,
    pub second_idx: usize,
    pub as_path: Vec<Asn>,
    pub path_len: usize,
    pub summary: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Row of the `flap_analysis_results` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlapRecord {
    pub time: DateTime<Utc>,
    pub prefix: Prefix,
    pub total_events: u64,
    pub flap_count: u64,
    pub first_update: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub summary: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Any record handed to the persistence layer, tagged with its destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum AnalysisRecord {
    #[serde(rename = "hijack_events")]
    Hijack(HijackRecord),
    #[serde(rename = "loop_analysis_results")]
    Loop(LoopRecord),
    #[serde(rename = "flap_analysis_results")]
    Flap(FlapRecord),
}

impl AnalysisRecord {
    /// Name of the destination table.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Hijack(_) => "hijack_events",
            Self::Loop(_) => "loop_analysis_results",
            Self::Flap(_) => "flap_analysis_results",
        }
    }

    pub fn prefix(&self) -> Prefix {
        match self {
            Self::Hijack(r) => r.prefix,
            Self::Loop(r) => r.prefix,
            Self::Flap(r) => r.prefix,
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Hijack(r) => &r.summary,
            Self::Loop(r) => &r.summary,
            Self::Flap(r) => &r.summary,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_update_from_csv() {
        let data = "received_at,collector,peer_asn,peer_address,prefix,as_path,next_hop,type\n\
                    1716595200.5,rrc00,3356,192.0.2.1,10.0.0.0/8,3356 1299 100,192.0.2.1,announcement\n\
                    1716595201,rrc00,3356,192.0.2.1,10.0.0.0/8,,,W\n";
        let mut csv = csv::Reader::from_reader(data.as_bytes());
        let rows: Vec<RawUpdate> = csv.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].received_at, 1716595200.5);
        assert_eq!(rows[0].as_path, vec![3356, 1299, 100]);
        assert_eq!(rows[0].next_hop.as_deref(), Some("192.0.2.1"));
        assert_eq!(rows[0].kind, UpdateKind::Announce);
        assert_eq!(rows[1].as_path, Vec::<Asn>::new());
        assert_eq!(rows[1].next_hop, None);
        assert_eq!(rows[1].kind, UpdateKind::Withdraw);
    }

    #[test]
    fn raw_update_from_json() {
        let row: RawUpdate = serde_json::from_str(
            r#"{"timestamp": "2024-05-25T00:00:00Z", "collector": "rrc21", "peer_asn": 64500,
                "peer_address": "2001:db8::1", "prefix": "2001:db8::/32",
                "as_path": [64500, [64501, 64502]], "type": "announce"}"#,
        )
        .unwrap();
        assert_eq!(row.received_at, 1716595200.0);
        assert_eq!(row.as_path, vec![64500, 64501]);
        assert_eq!(row.next_hop, None);
        assert_eq!(row.kind, UpdateKind::Announce);
    }

    #[test]
    fn update_kind_strings() {
        assert_eq!(UpdateKind::Announce.to_string(), "announcement");
        assert_eq!("W".parse::<UpdateKind>().unwrap(), UpdateKind::Withdraw);
        assert_eq!(
            "withdrawal".parse::<UpdateKind>().unwrap(),
            UpdateKind::Withdraw
        );
    }

    #[test]
    fn analysis_record_is_tagged() {
        let t = DateTime::from_timestamp(1716595200, 0).unwrap();
        let record = AnalysisRecord::Flap(FlapRecord {
            time: t,
            prefix: "10.0.0.0/8".parse().unwrap(),
            total_events: 13,
            flap_count: 12,
            first_update: t,
            last_update: t,
            summary: String::new(),
            analyzed_at: t,
        });
        assert_eq!(record.table(), "flap_analysis_results");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["table"], "flap_analysis_results");
        assert_eq!(json["flap_count"], 12);
        assert_eq!(json["prefix"], "10.0.0.0/8");
        let back: AnalysisRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
