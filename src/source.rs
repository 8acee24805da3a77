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
//! Readers for collector feeds: CSV exports, JSON lines, and MRT archives of BGP UPDATE messages.

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader, Read},
    net::IpAddr,
    path::{Path, PathBuf},
};

use bgpkit_parser::{
    error::ParserError,
    models::{
        AsPathSegment, Bgp4MpEnum, BgpMessage, BgpUpdateMessage, MrtMessage, MrtRecord,
        NetworkPrefix,
    },
    parse_mrt_record,
};
use flate2::bufread::GzDecoder;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    records::{RawUpdate, UpdateKind},
    Asn,
};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("MRT error: {0}")]
    Mrt(#[from] ParserError),
    #[error("Unknown input format of {0:?}, expected .csv, .json, .jsonl or .mrt (optionally .gz)")]
    UnknownFormat(PathBuf),
}

/// Any source of raw updates.
pub type BoxedSource = Box<dyn Iterator<Item = Result<RawUpdate, SourceError>> + Send>;

/// Raw updates from a CSV file with a header row naming the columns.
pub struct CsvSource<R: Read> {
    records: csv::DeserializeRecordsIntoIter<R, RawUpdate>,
}

impl<R: Read> CsvSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            records: csv::Reader::from_reader(reader).into_deserialize(),
        }
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<RawUpdate, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(|r| r.map_err(SourceError::from))
    }
}

/// Raw updates from a stream of JSON objects, one per line. Empty lines are skipped.
pub struct JsonLinesSource<R: BufRead> {
    lines: std::io::Lines<R>,
    line: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<RawUpdate, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line += 1;
            match line {
                Err(e) => return Some(Err(e.into())),
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => {
                    return Some(serde_json::from_str(&l).map_err(|source| SourceError::Json {
                        line: self.line,
                        source,
                    }))
                }
            }
        }
    }
}

/// Raw updates from an MRT archive of BGP4MP messages, as published by RIPE RIS and RouteViews.
/// MRT records carry no collector name, so all updates are attributed to `collector`. Records
/// other than BGP UPDATE messages (state changes, table dumps) are skipped.
pub struct MrtSource<R: Read> {
    reader: R,
    collector: String,
    pending: VecDeque<RawUpdate>,
    done: bool,
}

impl<R: Read> MrtSource<R> {
    pub fn new(reader: R, collector: impl Into<String>) -> Self {
        Self {
            reader,
            collector: collector.into(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn updates_of(&self, record: MrtRecord) -> Vec<RawUpdate> {
        let MrtMessage::Bgp4Mp(Bgp4MpEnum::Message(msg)) = record.message else {
            log::trace!("Skipping MRT record {:?}", record.common_header.entry_type);
            return Vec::new();
        };
        let BgpMessage::Update(update) = &msg.bgp_message else {
            return Vec::new();
        };
        let header = record.common_header;
        let received_at = header.timestamp as f64
            + header.microsecond_timestamp.unwrap_or_default() as f64 / 1e6;
        updates_from_bgp_message(
            update,
            received_at,
            &self.collector,
            u32::from(msg.peer_asn),
            msg.peer_ip,
        )
    }
}

impl<R: Read> Iterator for MrtSource<R> {
    type Item = Result<RawUpdate, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(Ok(update));
            }
            if self.done {
                return None;
            }
            match parse_mrt_record(&mut self.reader) {
                Ok(record) => {
                    let updates = self.updates_of(record);
                    self.pending.extend(updates);
                }
                Err(e) => match e.error {
                    ParserError::EofExpected => self.done = true,
                    // the stream cannot be resynchronized after a broken header
                    error @ (ParserError::IoError(_) | ParserError::EofError(_)) => {
                        self.done = true;
                        return Some(Err(error.into()));
                    }
                    error => return Some(Err(error.into())),
                },
            }
        }
    }
}

/// Collector name derived from a file name: everything before the first dot.
pub fn default_collector(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .filter(|n| !n.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Open a feed file, choosing the reader by its extension. Files ending in `.gz` are
/// decompressed on the fly. MRT files are recognized by the `.mrt` extension or by the `updates.`
/// prefix of the RIS and RouteViews archives. Their updates are attributed to `collector`.
pub fn open(path: impl AsRef<Path>, collector: &str) -> Result<BoxedSource, SourceError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let (name, gzipped) = match name.strip_suffix(".gz") {
        Some(stripped) => (stripped.to_string(), true),
        None => (name, false),
    };
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn BufRead + Send> = if gzipped {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(file)
    };

    match Path::new(&name).extension().and_then(|e| e.to_str()) {
        Some("csv") => Ok(Box::new(CsvSource::new(reader))),
        Some("json" | "jsonl" | "ndjson") => Ok(Box::new(JsonLinesSource::new(reader))),
        Some("mrt") => Ok(Box::new(MrtSource::new(reader, collector))),
        _ if name.starts_with("updates.") => Ok(Box::new(MrtSource::new(reader, collector))),
        _ => Err(SourceError::UnknownFormat(path.to_path_buf())),
    }
}

/// Flatten the AS path of a decoded message. `AS_SET`s are reduced to their first member, and
/// confederation segments are dropped.
fn flat_as_path(msg: &BgpUpdateMessage) -> Vec<Asn> {
    let Some(path) = msg.attributes.as_path() else {
        return Vec::new();
    };
    path.segments
        .iter()
        .flat_map(|segment| match segment {
            AsPathSegment::AsSequence(asns) => asns.iter().map(|a| u32::from(*a)).collect(),
            AsPathSegment::AsSet(asns) => asns.first().map(|a| u32::from(*a)).into_iter().collect(),
            AsPathSegment::ConfedSequence(_) | AsPathSegment::ConfedSet(_) => Vec::new(),
        })
        .collect()
}

/// Turn a decoded BGP UPDATE message, received from `peer_asn` at `peer_address`, into one raw
/// update per withdrawn and announced prefix (including the multiprotocol NLRI attributes).
/// Prefixes of the MP_REACH_NLRI attribute take its next hop, all others the NEXT_HOP
/// attribute.
pub fn updates_from_bgp_message(
    msg: &BgpUpdateMessage,
    received_at: f64,
    collector: &str,
    peer_asn: Asn,
    peer_address: IpAddr,
) -> Vec<RawUpdate> {
    let raw = |prefix: &NetworkPrefix,
               kind: UpdateKind,
               as_path: Vec<Asn>,
               next_hop: Option<String>| RawUpdate {
        received_at,
        collector: collector.to_string(),
        peer_asn,
        peer_address: peer_address.to_string(),
        prefix: prefix.prefix.to_string(),
        as_path,
        next_hop,
        kind,
    };

    let withdrawn = msg.withdrawn_prefixes.iter().chain(
        msg.attributes
            .get_unreachable_nlri()
            .into_iter()
            .flat_map(|nlri| nlri.prefixes.iter()),
    );
    let mut updates: Vec<RawUpdate> = withdrawn
        .map(|p| raw(p, UpdateKind::Withdraw, Vec::new(), None))
        .collect();

    let reachable = msg.attributes.get_reachable_nlri();
    let classic_hop = msg.attributes.next_hop();
    let mp_hop = reachable
        .and_then(|nlri| nlri.next_hop.as_ref())
        .map(|nh| nh.addr());
    let announced = msg
        .announced_prefixes
        .iter()
        .map(|p| (p, classic_hop.or(mp_hop)))
        .chain(
            reachable
                .into_iter()
                .flat_map(|nlri| nlri.prefixes.iter())
                .map(|p| (p, mp_hop.or(classic_hop))),
        )
        .collect_vec();
    if announced.is_empty() {
        return updates;
    }
    let as_path = flat_as_path(msg);
    if as_path.is_empty() {
        log::warn!("BGP update from AS{peer_asn} ({peer_address}) at {collector} has no AS path");
    }
    updates.extend(announced.into_iter().map(|(p, next_hop)| {
        raw(
            p,
            UpdateKind::Announce,
            as_path.clone(),
            next_hop.map(|nh| nh.to_string()),
        )
    }));
    updates
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use bgpkit_parser::{
        encoder::MrtUpdatesEncoder,
        models::{
            Afi, AsPath, Asn as BgpAsn, AttributeValue, Attributes, ElemType, NextHopAddress,
            Nlri, Safi,
        },
        BgpElem,
    };

    use super::*;
    use crate::normalizer::normalize;

    #[test]
    fn csv_source() {
        let data = "\
received_at,collector,peer_asn,peer_address,prefix,as_path,next_hop,type
1700000000.5,rrc00,64500,192.0.2.1,10.0.0.0/8,100 200 300,192.0.2.254,announcement
1700000001,rrc00,64500,192.0.2.1,10.0.0.0/8,,,withdrawal
";
        let updates: Vec<_> = CsvSource::new(Cursor::new(data))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].as_path, vec![100, 200, 300]);
        assert_eq!(updates[0].next_hop.as_deref(), Some("192.0.2.254"));
        assert_eq!(updates[1].kind, UpdateKind::Withdraw);
        assert!(updates[1].as_path.is_empty());
    }

    #[test]
    fn json_lines_source() {
        let data = r#"{"timestamp": 1700000000, "collector": "rrc00", "peer_asn": 64500, "peer_address": "192.0.2.1", "prefix": "10.0.0.0/8", "as_path": [100, [200, 300]], "type": "A"}

{"received_at": 1700000001, "collector": "rrc00", "peer_asn": 64500, "peer_address": "192.0.2.1", "prefix": "10.0.0.0/8", "type": "W"}
not json
"#;
        let updates: Vec<_> = JsonLinesSource::new(Cursor::new(data)).collect();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].as_ref().unwrap().as_path, vec![100, 200]);
        assert_eq!(updates[1].as_ref().unwrap().kind, UpdateKind::Withdraw);
        assert!(matches!(updates[2], Err(SourceError::Json { line: 4, .. })));
    }

    #[test]
    fn open_by_extension() {
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("bgpsentry-source-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let gz = dir.join("updates.jsonl.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&gz).unwrap(), Default::default());
        writeln!(
            encoder,
            r#"{{"received_at": 1700000000, "collector": "rrc00", "peer_asn": 64500, "peer_address": "192.0.2.1", "prefix": "10.0.0.0/8", "as_path": "100 200", "type": "announcement"}}"#
        )
        .unwrap();
        encoder.finish().unwrap();
        let updates: Vec<_> = open(&gz, "rrc00").unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].as_path, vec![100, 200]);

        // RIS archive names carry no extension
        let mrt = dir.join("updates.20231114.2200");
        File::create(&mrt).unwrap();
        assert_eq!(open(&mrt, "rrc00").unwrap().count(), 0);

        let parquet = dir.join("routes.parquet");
        File::create(&parquet).unwrap();
        assert!(matches!(open(&parquet, "rrc00"), Err(SourceError::UnknownFormat(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn collector_from_file_name() {
        assert_eq!(default_collector(Path::new("/data/rrc00.updates.jsonl")), "rrc00");
        assert_eq!(default_collector(Path::new(".hidden")), "unknown");
    }

    fn nlri(afi: Afi, next_hop: Option<NextHopAddress>, prefixes: &[&str]) -> Nlri {
        Nlri {
            afi,
            safi: Safi::Unicast,
            next_hop,
            prefixes: prefixes.iter().map(|p| network_prefix(p)).collect(),
        }
    }

    fn network_prefix(p: &str) -> NetworkPrefix {
        NetworkPrefix::new(p.parse().unwrap(), 0)
    }

    #[test]
    fn bgp_update_message() {
        let path = AsPath::from_segments(vec![
            AsPathSegment::ConfedSequence(vec![BgpAsn::from(65001)]),
            AsPathSegment::sequence([3356, 1299]),
            AsPathSegment::set([200, 100]),
        ]);
        let attributes = Attributes::from_iter(vec![
            AttributeValue::from(path),
            AttributeValue::NextHop("192.0.2.254".parse().unwrap()),
            AttributeValue::MpReachNlri(nlri(
                Afi::Ipv6,
                Some(NextHopAddress::Ipv6("2001:db8::1".parse().unwrap())),
                &["2001:db8:1::/48"],
            )),
            AttributeValue::MpUnreachNlri(nlri(Afi::Ipv6, None, &["2001:db8:2::/48"])),
        ]);
        let msg = BgpUpdateMessage {
            withdrawn_prefixes: vec![network_prefix("198.51.100.0/24")],
            attributes,
            announced_prefixes: vec![network_prefix("203.0.113.0/24")],
        };
        let updates = updates_from_bgp_message(
            &msg,
            1_700_000_000.25,
            "rrc00",
            64500,
            "192.0.2.1".parse().unwrap(),
        );

        let summary = updates
            .iter()
            .map(|u| (u.prefix.as_str(), u.kind, u.next_hop.as_deref()))
            .collect_vec();
        assert_eq!(
            summary,
            vec![
                ("198.51.100.0/24", UpdateKind::Withdraw, None),
                ("2001:db8:2::/48", UpdateKind::Withdraw, None),
                ("203.0.113.0/24", UpdateKind::Announce, Some("192.0.2.254")),
                ("2001:db8:1::/48", UpdateKind::Announce, Some("2001:db8::1")),
            ]
        );
        // the AS_SET is reduced to its first member, the confederation segment is dropped
        assert_eq!(updates[2].as_path, vec![3356, 1299, 200]);
        assert_eq!(updates[3].as_path, vec![3356, 1299, 200]);
        assert!(updates[0].as_path.is_empty());
        for update in &updates {
            assert_eq!(update.received_at, 1_700_000_000.25);
            assert_eq!(update.collector, "rrc00");
            assert_eq!(update.peer_asn, 64500);
            assert_eq!(update.peer_address, "192.0.2.1");
            assert!(normalize(update).is_ok());
        }
    }

    #[test]
    fn next_hop_falls_back() {
        // IPv4 announced through MP_REACH_NLRI only, without a next hop of its own
        let attributes = Attributes::from_iter(vec![
            AttributeValue::from(AsPath::from_sequence([3356, 100])),
            AttributeValue::NextHop("192.0.2.254".parse().unwrap()),
            AttributeValue::MpReachNlri(nlri(Afi::Ipv4, None, &["10.0.0.0/8"])),
        ]);
        let msg = BgpUpdateMessage {
            withdrawn_prefixes: Vec::new(),
            attributes,
            announced_prefixes: Vec::new(),
        };
        let updates =
            updates_from_bgp_message(&msg, 1.0, "rrc00", 64500, "192.0.2.1".parse().unwrap());
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].next_hop.as_deref(), Some("192.0.2.254"));
        assert_eq!(updates[0].as_path, vec![3356, 100]);
    }

    #[test]
    fn mrt_source() {
        let mut encoder = MrtUpdatesEncoder::new();
        let mut elem = BgpElem {
            timestamp: 1_700_000_000.5,
            peer_ip: "192.0.2.1".parse().unwrap(),
            peer_asn: BgpAsn::from(64500),
            next_hop: Some("192.0.2.254".parse().unwrap()),
            ..Default::default()
        };
        elem.prefix.prefix = "10.250.0.0/24".parse().unwrap();
        encoder.process_elem(&elem);
        elem.elem_type = ElemType::WITHDRAW;
        elem.prefix.prefix = "10.251.0.0/24".parse().unwrap();
        encoder.process_elem(&elem);
        let bytes = encoder.export_bytes().to_vec();

        let updates: Vec<_> = MrtSource::new(Cursor::new(bytes), "rrc03")
            .collect::<Result<_, _>>()
            .unwrap();
        let summary = updates
            .iter()
            .map(|u| (u.prefix.as_str(), u.kind))
            .collect_vec();
        assert_eq!(
            summary,
            vec![
                ("10.250.0.0/24", UpdateKind::Announce),
                ("10.251.0.0/24", UpdateKind::Withdraw),
            ]
        );
        for update in &updates {
            assert_eq!(update.received_at, 1_700_000_000.5);
            assert_eq!(update.collector, "rrc03");
            assert_eq!(update.peer_asn, 64500);
            assert_eq!(update.peer_address, "192.0.2.1");
        }
    }

    #[test]
    fn truncated_mrt_record() {
        let mut encoder = MrtUpdatesEncoder::new();
        let mut elem = BgpElem {
            peer_asn: BgpAsn::from(64500),
            ..Default::default()
        };
        elem.prefix.prefix = "10.250.0.0/24".parse().unwrap();
        encoder.process_elem(&elem);
        let mut bytes = encoder.export_bytes().to_vec();
        bytes.truncate(bytes.len() - 3);

        let items: Vec<_> = MrtSource::new(Cursor::new(bytes), "rrc00").collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(SourceError::Mrt(_))));
    }
}
