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
//! Detector and pipeline configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound of all configured durations: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

/// What the emitter does when its queue of pending events is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest pending event to make room for the new one.
    DropOldest,
    /// Wait for room for at most `timeout_ms`, then drop the new event.
    BlockWithTimeout { timeout_ms: u64 },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Maximum number of events waiting to be persisted.
    pub capacity: usize,
    pub policy: BackpressurePolicy,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            policy: BackpressurePolicy::default(),
        }
    }
}

/// All thresholds and durations of the detection engine. Every field has a default, such that a
/// configuration file only needs to name the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Window granularity for all detectors.
    pub bucket_secs: u64,
    /// Maximum out-of-order delay before an update is treated as late.
    pub lateness_secs: u64,
    /// Minimum number of distinct peers that must observe an origin for it to count.
    pub min_peer_corroboration: usize,
    /// Flap fires when the transition count of a window exceeds this value.
    pub flap_threshold: u64,
    /// If set, only transitions whose two updates are at most this far apart are counted.
    pub flap_interval_secs: Option<u64>,
    /// Number of closed buckets contributing to the baseline origin.
    pub baseline_lookback_buckets: u64,
    /// Weight factor per bucket of age in the baseline vote. `1.0` is a plain majority.
    pub baseline_decay: f64,
    /// Windows with fewer announcements are not evaluated by Origin-Hijack and MOAS.
    pub min_window_events: u64,
    /// Origin-Hijack requires the top origin to reach at least this share of the window.
    pub origin_min_ratio: f64,
    /// Sub-Prefix-Hijack requires the child's top origin to be seen by enough peers.
    pub subprefix_require_corroboration: bool,
    /// Do not report consecutive repeats (AS-path prepending) as loops.
    pub ignore_prepending: bool,
    /// Number of buckets for which emitted events are remembered for deduplication.
    pub dedup_retention_buckets: u64,
    /// Number of shard workers owning disjoint prefix sets.
    pub num_shards: usize,
    /// Capacity of each shard's input channel.
    pub channel_capacity: usize,
    pub emitter: EmitterConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 300,
            lateness_secs: 60,
            min_peer_corroboration: 2,
            flap_threshold: 10,
            flap_interval_secs: None,
            baseline_lookback_buckets: 2016,
            baseline_decay: 1.0,
            min_window_events: 1,
            origin_min_ratio: 0.0,
            subprefix_require_corroboration: false,
            ignore_prepending: true,
            dedup_retention_buckets: 288,
            num_shards: num_cpus::get(),
            channel_capacity: 1024,
            emitter: EmitterConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Read the configuration from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check all thresholds. Invalid configurations must be rejected before ingestion starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_secs == 0 {
            return Err(ConfigError::Zero("bucket_secs"));
        }
        if self.min_peer_corroboration == 0 {
            return Err(ConfigError::Zero("min_peer_corroboration"));
        }
        if self.flap_threshold == 0 {
            return Err(ConfigError::Zero("flap_threshold"));
        }
        if self.flap_interval_secs == Some(0) {
            return Err(ConfigError::Zero("flap_interval_secs"));
        }
        if self.baseline_lookback_buckets == 0 {
            return Err(ConfigError::Zero("baseline_lookback_buckets"));
        }
        if self.dedup_retention_buckets == 0 {
            return Err(ConfigError::Zero("dedup_retention_buckets"));
        }
        if self.num_shards == 0 {
            return Err(ConfigError::Zero("num_shards"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel_capacity"));
        }
        for (field, value) in [
            ("bucket_secs", Some(self.bucket_secs)),
            ("lateness_secs", Some(self.lateness_secs)),
            ("flap_interval_secs", self.flap_interval_secs),
        ] {
            if let Some(value) = value.filter(|v| *v > MAX_DURATION_SECS) {
                return Err(ConfigError::TooLarge {
                    field,
                    value,
                    max: MAX_DURATION_SECS,
                });
            }
        }
        if self.emitter.capacity == 0 {
            return Err(ConfigError::Zero("emitter.capacity"));
        }
        if let BackpressurePolicy::BlockWithTimeout { timeout_ms: 0 } = self.emitter.policy {
            return Err(ConfigError::Zero("emitter.timeout_ms"));
        }
        if !(self.baseline_decay > 0.0 && self.baseline_decay <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "baseline_decay",
                value: self.baseline_decay,
                range: "(0, 1]",
            });
        }
        if !(0.0..=1.0).contains(&self.origin_min_ratio) {
            return Err(ConfigError::OutOfRange {
                field: "origin_min_ratio",
                value: self.origin_min_ratio,
                range: "[0, 1]",
            });
        }
        Ok(())
    }

    pub fn bucket(&self) -> Duration {
        Duration::from_secs(self.bucket_secs)
    }

    pub fn lateness(&self) -> Duration {
        Duration::from_secs(self.lateness_secs)
    }

    pub fn flap_interval(&self) -> Option<Duration> {
        self.flap_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("`{field}` = {value} is outside of {range}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },
    #[error("`{field}` = {value} exceeds the maximum of {max}")]
    TooLarge {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("Cannot read the configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse the configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bucket(), Duration::from_secs(300));
        assert_eq!(config.lateness(), Duration::from_secs(60));
    }

    #[test]
    fn partial_json() {
        let config: DetectorConfig = serde_json::from_str(
            r#"{"bucket_secs": 60, "emitter": {"capacity": 8, "policy": {"block_with_timeout": {"timeout_ms": 250}}}}"#,
        )
        .unwrap();
        assert_eq!(config.bucket_secs, 60);
        assert_eq!(config.flap_threshold, 10);
        assert_eq!(config.emitter.capacity, 8);
        assert_eq!(
            config.emitter.policy,
            BackpressurePolicy::BlockWithTimeout { timeout_ms: 250 }
        );

        let config: DetectorConfig =
            serde_json::from_str(r#"{"emitter": {"policy": "drop_oldest"}}"#).unwrap();
        assert_eq!(config.emitter.capacity, 4096);
        assert_eq!(config.emitter.policy, BackpressurePolicy::DropOldest);
    }

    #[test]
    fn invalid_thresholds() {
        let config = DetectorConfig {
            bucket_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("bucket_secs"))
        ));

        let config = DetectorConfig {
            baseline_decay: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "baseline_decay",
                ..
            })
        ));

        let config = DetectorConfig {
            baseline_decay: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.emitter.policy = BackpressurePolicy::BlockWithTimeout { timeout_ms: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_are_bounded() {
        let config = DetectorConfig {
            lateness_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge {
                field: "lateness_secs",
                ..
            })
        ));

        let config = DetectorConfig {
            bucket_secs: MAX_DURATION_SECS + 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge {
                field: "bucket_secs",
                ..
            })
        ));

        let config = DetectorConfig {
            bucket_secs: MAX_DURATION_SECS,
            lateness_secs: MAX_DURATION_SECS,
            flap_interval_secs: Some(MAX_DURATION_SECS),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
