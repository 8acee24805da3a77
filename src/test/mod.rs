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
//! Scenario tests driving the whole engine with synthetic update streams.
//!
//! Use the following command to see the logs:
//!
//! ```shell
//! RUST_LOG=bgpsentry=debug cargo test -- --nocapture --test-threads 1
//! ```

use crate::{
    config::DetectorConfig,
    engine::Engine,
    event::{AnomalyEvent, EventKind},
    records::{RawUpdate, UpdateKind},
    Asn,
};

mod moas;
mod pipeline;

/// Start of the first bucket of all scenarios, aligned to a full hour.
pub const T0: f64 = 1_699_999_200.0;

/// Announcement of `prefix` at `T0 + secs`, received from peer number `peer`.
pub fn announce(secs: f64, peer: u8, prefix: &str, as_path: &[Asn]) -> RawUpdate {
    RawUpdate {
        received_at: T0 + secs,
        collector: "rrc00".to_string(),
        peer_asn: 64500 + peer as Asn,
        peer_address: format!("192.0.2.{peer}"),
        prefix: prefix.to_string(),
        as_path: as_path.to_vec(),
        next_hop: Some(format!("192.0.2.{peer}")),
        kind: UpdateKind::Announce,
    }
}

pub fn withdraw(secs: f64, peer: u8, prefix: &str) -> RawUpdate {
    RawUpdate {
        as_path: Vec::new(),
        next_hop: None,
        kind: UpdateKind::Withdraw,
        ..announce(secs, peer, prefix, &[])
    }
}

/// Default configuration with a single shard, such that tests do not depend on the machine.
pub fn config() -> DetectorConfig {
    DetectorConfig {
        num_shards: 1,
        ..Default::default()
    }
}

/// Feed all updates into a new engine and flush it at the end.
pub fn run(config: DetectorConfig, updates: &[RawUpdate]) -> (Engine, Vec<AnomalyEvent>) {
    let mut engine = Engine::new(config).unwrap();
    let mut events = Vec::new();
    for update in updates {
        events.extend(engine.ingest(update).unwrap());
    }
    events.extend(engine.flush());
    (engine, events)
}

pub fn of_kind(events: &[AnomalyEvent], kind: EventKind) -> Vec<&AnomalyEvent> {
    events.iter().filter(|e| e.kind() == kind).collect()
}
