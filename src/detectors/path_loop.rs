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
//! Path-Loop: an AS number appearing twice in an AS path.

use std::collections::HashMap;

use super::{DetectionContext, Detector, Verdict};
use crate::{
    event::{AnomalyEvent, EventKind, PathLoop},
    Asn,
};

/// Find all repeated AS numbers of a path, as `(asn, first_idx, second_idx)` in the order in
/// which the repetitions appear. Each AS is reported once, at its first repetition, where
/// `first_idx` is the closest earlier position of the same AS. With `ignore_prepending`,
/// consecutive repetitions do not count.
pub fn find_loops(path: &[Asn], ignore_prepending: bool) -> Vec<(Asn, usize, usize)> {
    let mut last_pos: HashMap<Asn, usize> = HashMap::new();
    let mut loops: Vec<(Asn, usize, usize)> = Vec::new();
    for (idx, asn) in path.iter().copied().enumerate() {
        if let Some(prev) = last_pos.insert(asn, idx) {
            let prepended = idx - prev == 1;
            if !(ignore_prepending && prepended) && !loops.iter().any(|(a, _, _)| *a == asn) {
                loops.push((asn, prev, idx));
            }
        }
    }
    loops
}

/// Reports the loops recorded while the window was open, one event per repeated AS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathLoopDetector;

impl Detector for PathLoopDetector {
    fn kind(&self) -> EventKind {
        EventKind::PathLoop
    }

    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Verdict {
        let window = ctx.window;
        if window.loops.is_empty() {
            return Verdict::Quiet;
        }
        Verdict::Fired(
            window
                .loops
                .values()
                .map(|l| {
                    AnomalyEvent::PathLoop(PathLoop {
                        prefix: ctx.prefix,
                        bounds: window.bounds,
                        time: l.timestamp,
                        peer: l.peer,
                        repeat_as: l.repeat_as,
                        first_idx: l.first_idx,
                        second_idx: l.second_idx,
                        as_path: l.as_path.clone(),
                    })
                })
                .collect(),
        )
    }
}
