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
//! Sub-Prefix-Hijack: a more-specific prefix whose dominating origin differs from the one of its
//! closest tracked parent.

use super::{DetectionContext, Detector, SkipReason, Verdict};
use crate::{
    config::DetectorConfig,
    event::{AnomalyEvent, EventKind, SubPrefixHijack},
};

#[derive(Debug, Clone)]
pub struct SubPrefixDetector {
    pub min_peers: usize,
    pub require_corroboration: bool,
    /// Parent windows older than this many buckets are not compared against.
    pub lookback_buckets: u64,
}

impl SubPrefixDetector {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            min_peers: config.min_peer_corroboration,
            require_corroboration: config.subprefix_require_corroboration,
            lookback_buckets: config.baseline_lookback_buckets,
        }
    }
}

impl Detector for SubPrefixDetector {
    fn kind(&self) -> EventKind {
        EventKind::SubPrefixHijack
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict {
        let window = ctx.window;
        let Some(child_origin) = window.top_origin() else {
            return Verdict::Quiet;
        };
        // only the nearest tracked ancestor is compared
        let Some(parent) = ctx.index.longest_covering_parent(&ctx.prefix) else {
            return Verdict::Quiet;
        };
        let bucket = window.bounds.bucket;
        let summary = parent
            .lock()
            .closed_summary(bucket)
            .filter(|s| s.bucket > bucket.saturating_sub(self.lookback_buckets as i64))
            .cloned();
        let Some((summary, parent_origin)) =
            summary.and_then(|s| s.top_origin.map(|top| (s, top)))
        else {
            return Verdict::Skipped(SkipReason::MissingParentWindow);
        };

        if parent_origin == child_origin {
            return Verdict::Quiet;
        }
        if self.require_corroboration && window.origin_peers(child_origin) < self.min_peers {
            return Verdict::Quiet;
        }

        Verdict::fired(AnomalyEvent::SubPrefixHijack(SubPrefixHijack {
            parent_prefix: parent.prefix,
            more_specific: ctx.prefix,
            bounds: window.bounds,
            parent_bucket: summary.bucket,
            parent_origin,
            parent_origins: summary.origins.keys().copied().collect(),
            child_origin,
            child_origins: window.origins.keys().copied().collect(),
            distinct_peers: window.peers.len(),
            total_events: window.total_events(),
            first_update: window.first_update,
            last_update: window.last_update,
        }))
    }
}
