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
//! Flap: too many announce/withdraw transitions within one window.

use super::{DetectionContext, Detector, Verdict};
use crate::{
    config::DetectorConfig,
    event::{AnomalyEvent, EventKind, Flap},
};

#[derive(Debug, Clone)]
pub struct FlapDetector {
    /// Fires when the number of transitions exceeds this value.
    pub threshold: u64,
}

impl FlapDetector {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            threshold: config.flap_threshold,
        }
    }
}

impl Detector for FlapDetector {
    fn kind(&self) -> EventKind {
        EventKind::Flap
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict {
        let window = ctx.window;
        if window.transitions <= self.threshold {
            return Verdict::Quiet;
        }
        Verdict::fired(AnomalyEvent::Flap(Flap {
            prefix: ctx.prefix,
            bounds: window.bounds,
            total_events: window.total_events(),
            flap_count: window.transitions,
            first_update: window.first_update,
            last_update: window.last_update,
        }))
    }
}
