//! Module that allows to (de-)serialize an AS path with `serde`.
//!
//! Collectors disagree on how they ship AS paths. This module accepts all of the following and
//! always produces a flat `Vec<Asn>`:
//!
//! - a string in the textual form `"100 200 {300,400}"` (CSV exports),
//! - a JSON array whose items are either AS numbers or nested arrays for `AS_SET`s (RIS Live),
//! - a single number (a path of length one, as typed by CSV readers),
//! - a missing value or `null` (withdrawals).
//!
//! Serialization always writes the textual form.

use serde::{de::Error, Deserialize, Deserializer, Serializer};

use crate::as_path::{format_as_path, parse_as_path, Asn};

#[derive(Deserialize)]
#[serde(untagged)]
enum AsPathRepr {
    Single(Asn),
    Text(String),
    Segments(Vec<Segment>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Segment {
    Asn(Asn),
    Set(Vec<Asn>),
}

/// Serialize an AS path as whitespace-separated AS numbers.
pub fn serialize<S: Serializer>(path: &[Asn], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_as_path(path))
}

/// Deserialize an AS path from any of the supported representations.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Asn>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<AsPathRepr>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(AsPathRepr::Single(asn)) => Ok(vec![asn]),
        Some(AsPathRepr::Text(text)) => parse_as_path(&text).map_err(D::Error::custom),
        Some(AsPathRepr::Segments(segments)) => segments
            .into_iter()
            .map(|segment| match segment {
                Segment::Asn(asn) => Ok(asn),
                Segment::Set(set) => set
                    .first()
                    .copied()
                    .ok_or_else(|| D::Error::custom("empty AS_SET in AS path")),
            })
            .collect(),
    }
}
