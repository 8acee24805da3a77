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
//! Rule evaluators running on sealed windows.
//!
//! Every detector is a pure function of the sealed window, the baseline origin of its prefix (as
//! of the buckets before the window), and the prefix index. None of them mutates any state, such
//! that they can run in parallel on the windows of different prefixes.

use crate::{
    config::DetectorConfig, event::AnomalyEvent, event::EventKind, prefix_index::PrefixIndex,
    window::WindowState, Asn, Prefix,
};

pub mod flap;
pub mod moas;
pub mod origin;
pub mod path_loop;
pub mod subprefix;

pub use flap::FlapDetector;
pub use moas::MoasDetector;
pub use origin::OriginHijackDetector;
pub use path_loop::PathLoopDetector;
pub use subprefix::SubPrefixDetector;

/// Everything a detector may look at.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub prefix: Prefix,
    pub window: &'a WindowState,
    /// Baseline origin computed from the closed windows before this one.
    pub baseline: Option<Asn>,
    pub index: &'a PrefixIndex,
}

/// Why a detector did not evaluate a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SkipReason {
    /// The prefix has no history to compare against.
    MissingBaseline,
    /// The covering parent has no closed window to compare against.
    MissingParentWindow,
}

/// Outcome of a single detector on a single window.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Evaluated, nothing found.
    Quiet,
    Fired(Vec<AnomalyEvent>),
    /// Not evaluated. Reported, never fatal.
    Skipped(SkipReason),
}

impl Verdict {
    /// Fire a single event.
    pub fn fired(event: AnomalyEvent) -> Self {
        Self::Fired(vec![event])
    }
}

pub trait Detector: Send + Sync {
    fn kind(&self) -> EventKind;

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict;
}

/// Result of running all detectors on one window.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub events: Vec<AnomalyEvent>,
    pub skipped: Vec<(EventKind, SkipReason)>,
}

/// The configured set of detectors.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.detectors.iter().map(|d| d.kind()))
            .finish()
    }
}

impl DetectorSet {
    /// All five detectors, configured with the given thresholds.
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(vec![
            Box::new(OriginHijackDetector::from_config(config)),
            Box::new(SubPrefixDetector::from_config(config)),
            Box::new(MoasDetector::from_config(config)),
            Box::new(PathLoopDetector),
            Box::new(FlapDetector::from_config(config)),
        ])
    }

    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.detectors.iter().map(|d| d.kind())
    }

    pub fn evaluate(&self, ctx: &DetectionContext<'_>) -> Evaluation {
        let mut result = Evaluation::default();
        for detector in &self.detectors {
            match detector.evaluate(ctx) {
                Verdict::Quiet => {}
                Verdict::Fired(events) => result.events.extend(events),
                Verdict::Skipped(reason) => result.skipped.push((detector.kind(), reason)),
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn all_detectors_configured() {
        let set = DetectorSet::from_config(&DetectorConfig::default());
        let kinds: Vec<_> = set.kinds().collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::OriginHijack,
                EventKind::SubPrefixHijack,
                EventKind::Moas,
                EventKind::PathLoop,
                EventKind::Flap,
            ]
        );
    }
}
