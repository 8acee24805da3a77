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
//! MOAS: several origins for the same prefix in the same window, each seen by enough peers.

use std::collections::BTreeSet;

use super::{DetectionContext, Detector, Verdict};
use crate::{
    config::DetectorConfig,
    event::{origin_evidence, AnomalyEvent, EventKind, Moas},
    Asn,
};

#[derive(Debug, Clone)]
pub struct MoasDetector {
    pub min_peers: usize,
    pub min_events: u64,
}

impl MoasDetector {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            min_peers: config.min_peer_corroboration,
            min_events: config.min_window_events,
        }
    }
}

impl Detector for MoasDetector {
    fn kind(&self) -> EventKind {
        EventKind::Moas
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict {
        let window = ctx.window;
        if window.announcements < self.min_events {
            return Verdict::Quiet;
        }
        let corroborated: Vec<Asn> = window
            .origins
            .iter()
            .filter(|(_, stats)| stats.peers.len() >= self.min_peers)
            .map(|(asn, _)| *asn)
            .collect();
        if corroborated.len() < 2 {
            return Verdict::Quiet;
        }
        let peers: BTreeSet<_> = corroborated
            .iter()
            .flat_map(|asn| window.origins[asn].peers.iter())
            .collect();

        Verdict::fired(AnomalyEvent::Moas(Moas {
            prefix: ctx.prefix,
            bounds: window.bounds,
            distinct_peers: peers.len(),
            origins: corroborated,
            total_events: window.announcements,
            first_update: window.first_update,
            last_update: window.last_update,
            per_origin: origin_evidence(window),
        }))
    }
}
