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
//! Validation and canonicalization of incoming updates. Every update that reaches the window
//! manager went through [`normalize`].

use std::net::IpAddr;

use chrono::DateTime;
use thiserror::Error;

use crate::{
    records::{PeerId, RawUpdate, UpdateKind, UpdateRecord},
    Asn, Prefix,
};

/// Reason why an update was rejected. Never fatal: the update is dropped and counted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid prefix `{0}`")]
    InvalidPrefix(String),
    #[error("Prefix `{0}` has no prefix length")]
    MissingPrefixLength(String),
    #[error("Announcement of {0} without an AS path")]
    EmptyAsPath(Prefix),
    #[error("AS path {path:?} of {prefix} contains AS 0")]
    ReservedAsn { prefix: Prefix, path: Vec<Asn> },
    #[error("Peer ASN must not be 0")]
    InvalidPeerAsn,
    #[error("Invalid peer address `{0}`")]
    InvalidPeerAddress(String),
    #[error("Invalid next hop `{0}`")]
    InvalidNextHop(String),
    #[error("Missing collector id")]
    MissingCollector,
    #[error("Invalid timestamp {0}")]
    InvalidTimestamp(f64),
}

impl ValidationError {
    /// Short label of the error kind, used to aggregate rejected updates in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPrefix(_) => "invalid_prefix",
            Self::MissingPrefixLength(_) => "missing_prefix_length",
            Self::EmptyAsPath(_) => "empty_as_path",
            Self::ReservedAsn { .. } => "reserved_asn",
            Self::InvalidPeerAsn => "invalid_peer_asn",
            Self::InvalidPeerAddress(_) => "invalid_peer_address",
            Self::InvalidNextHop(_) => "invalid_next_hop",
            Self::MissingCollector => "missing_collector",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Validate a raw update and bring it into canonical form.
pub fn normalize(raw: &RawUpdate) -> Result<UpdateRecord, ValidationError> {
    let collector = raw.collector.trim();
    if collector.is_empty() {
        return Err(ValidationError::MissingCollector);
    }

    let timestamp = parse_timestamp(raw.received_at)?;
    let prefix = parse_prefix(&raw.prefix)?;

    if raw.peer_asn == 0 {
        return Err(ValidationError::InvalidPeerAsn);
    }
    let peer_address: IpAddr = raw
        .peer_address
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidPeerAddress(raw.peer_address.clone()))?;

    let next_hop = match raw.next_hop.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(nh) => Some(
            nh.parse::<IpAddr>()
                .map_err(|_| ValidationError::InvalidNextHop(nh.to_string()))?,
        ),
    };

    if raw.kind == UpdateKind::Announce && raw.as_path.is_empty() {
        return Err(ValidationError::EmptyAsPath(prefix));
    }
    if raw.as_path.contains(&0) {
        return Err(ValidationError::ReservedAsn {
            prefix,
            path: raw.as_path.clone(),
        });
    }

    Ok(UpdateRecord {
        timestamp,
        collector: collector.to_string(),
        peer: PeerId {
            peer_asn: raw.peer_asn,
            peer_address,
        },
        prefix,
        as_path: raw.as_path.clone(),
        next_hop,
        kind: raw.kind,
    })
}

impl TryFrom<&RawUpdate> for UpdateRecord {
    type Error = ValidationError;

    fn try_from(raw: &RawUpdate) -> Result<Self, Self::Error> {
        normalize(raw)
    }
}

/// Parse a prefix in `network/length` notation. Host bits are cleared.
pub fn parse_prefix(s: &str) -> Result<Prefix, ValidationError> {
    let s = s.trim();
    if !s.contains('/') {
        return if s.parse::<IpAddr>().is_ok() {
            Err(ValidationError::MissingPrefixLength(s.to_string()))
        } else {
            Err(ValidationError::InvalidPrefix(s.to_string()))
        };
    }
    s.parse::<Prefix>()
        .map(|p| p.trunc())
        .map_err(|_| ValidationError::InvalidPrefix(s.to_string()))
}

fn parse_timestamp(secs: f64) -> Result<DateTime<chrono::Utc>, ValidationError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ValidationError::InvalidTimestamp(secs));
    }
    let millis = (secs * 1000.0).round();
    if millis > i64::MAX as f64 {
        return Err(ValidationError::InvalidTimestamp(secs));
    }
    DateTime::from_timestamp_millis(millis as i64).ok_or(ValidationError::InvalidTimestamp(secs))
}
