//! Module that allows to deserialize a timestamp as seconds since the UNIX epoch, given either as
//! a number (`1716595200.25`), a numeric string, or an RFC 3339 string
//! (`"2024-05-25T00:00:00.250Z"`).

use chrono::DateTime;
use serde::{de::Error, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    Seconds(f64),
    Text(String),
}

/// Serialize the epoch seconds as a float.
pub fn serialize<S: Serializer>(secs: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(*secs)
}

/// Deserialize epoch seconds from a number or string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match TimestampRepr::deserialize(deserializer)? {
        TimestampRepr::Seconds(secs) => Ok(secs),
        TimestampRepr::Text(text) => parse_timestamp(&text).map_err(D::Error::custom),
    }
}

/// Parse a timestamp string into epoch seconds.
pub fn parse_timestamp(text: &str) -> Result<f64, String> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<f64>() {
        return Ok(secs);
    }
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.timestamp_millis() as f64 / 1000.0)
        .map_err(|e| format!("invalid timestamp `{text}`: {e}"))
}

#[cfg(test)]
mod test {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Row {
        #[serde(with = "super")]
        time: f64,
    }

    #[test]
    fn parsing() {
        let row: Row = serde_json::from_str(r#"{"time": 1716595200.25}"#).unwrap();
        assert_eq!(row.time, 1716595200.25);
        let row: Row = serde_json::from_str(r#"{"time": "1716595200"}"#).unwrap();
        assert_eq!(row.time, 1716595200.0);
        let row: Row = serde_json::from_str(r#"{"time": "2024-05-25T00:00:00.250Z"}"#).unwrap();
        assert_eq!(row.time, 1716595200.25);
        assert!(serde_json::from_str::<Row>(r#"{"time": "yesterday"}"#).is_err());
    }
}
