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
//! Origin-Hijack: a window dominated by an origin other than the prefix's baseline.

use super::{DetectionContext, Detector, SkipReason, Verdict};
use crate::{
    config::DetectorConfig,
    event::{origin_evidence, AnomalyEvent, EventKind, OriginHijack},
    window::WindowState,
    Asn,
};

#[derive(Debug, Clone)]
pub struct OriginHijackDetector {
    pub min_peers: usize,
    pub min_events: u64,
    pub min_ratio: f64,
}

impl OriginHijackDetector {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            min_peers: config.min_peer_corroboration,
            min_events: config.min_window_events,
            min_ratio: config.origin_min_ratio,
        }
    }
}

/// The most frequent origin of the window other than `baseline`. Ties go to the lowest ASN.
pub fn top_foreign_origin(window: &WindowState, baseline: Asn) -> Option<(Asn, u64)> {
    window
        .origins
        .iter()
        .filter(|(asn, _)| **asn != baseline)
        .max_by(|(a_asn, a), (b_asn, b)| a.count.cmp(&b.count).then(b_asn.cmp(a_asn)))
        .map(|(asn, stats)| (*asn, stats.count))
}

impl Detector for OriginHijackDetector {
    fn kind(&self) -> EventKind {
        EventKind::OriginHijack
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict {
        let window = ctx.window;
        if window.announcements == 0 || window.announcements < self.min_events {
            return Verdict::Quiet;
        }
        let Some(baseline) = ctx.baseline else {
            return Verdict::Skipped(SkipReason::MissingBaseline);
        };
        let Some((top, count)) = top_foreign_origin(window, baseline) else {
            return Verdict::Quiet;
        };
        // without the baseline in the window, this is more likely a renumbering
        if !window.origins.contains_key(&baseline) {
            return Verdict::Quiet;
        }
        let distinct_peers = window.origin_peers(top);
        if distinct_peers < self.min_peers {
            return Verdict::Quiet;
        }
        let top_ratio = count as f64 / window.announcements as f64;
        if top_ratio < self.min_ratio {
            return Verdict::Quiet;
        }

        Verdict::fired(AnomalyEvent::OriginHijack(OriginHijack {
            prefix: ctx.prefix,
            bounds: window.bounds,
            baseline_origin: baseline,
            top_origin: top,
            top_ratio,
            distinct_peers,
            total_events: window.announcements,
            first_update: window.first_update,
            last_update: window.last_update,
            per_origin: origin_evidence(window),
        }))
    }
}
