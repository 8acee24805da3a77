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
use super::*;

const PREFIX: &str = "198.51.100.0/24";

#[test]
fn two_corroborated_origins() {
    let updates = [
        announce(10.0, 1, PREFIX, &[3356, 100]),
        announce(11.0, 2, PREFIX, &[1299, 100]),
        announce(12.0, 3, PREFIX, &[174, 300]),
        announce(13.0, 4, PREFIX, &[6939, 300]),
    ];
    let (_, events) = run(config(), &updates);
    let moas = of_kind(&events, EventKind::Moas);
    assert_eq!(moas.len(), 1);
    let AnomalyEvent::Moas(e) = moas[0] else {
        unreachable!()
    };
    assert_eq!(e.origins, vec![100, 300]);
    assert_eq!(e.distinct_peers, 4);
    assert_eq!(e.total_events, 4);
    assert_eq!(e.per_origin[&300].peers.len(), 2);
    assert!(moas[0].summary().contains("origins=[100, 300]"));
}

#[test]
fn single_misbehaving_peer() {
    let updates = [
        announce(10.0, 1, PREFIX, &[3356, 100]),
        announce(11.0, 2, PREFIX, &[1299, 100]),
        announce(12.0, 3, PREFIX, &[174, 300]),
        announce(13.0, 3, PREFIX, &[174, 300]),
        announce(14.0, 3, PREFIX, &[174, 300]),
    ];
    let (_, events) = run(config(), &updates);
    assert!(of_kind(&events, EventKind::Moas).is_empty());
}

#[test]
fn only_within_one_window() {
    // each origin is corroborated, but in different windows
    let updates = [
        announce(10.0, 1, PREFIX, &[3356, 100]),
        announce(11.0, 2, PREFIX, &[1299, 100]),
        announce(310.0, 3, PREFIX, &[174, 300]),
        announce(311.0, 4, PREFIX, &[6939, 300]),
    ];
    let (_, events) = run(config(), &updates);
    assert!(of_kind(&events, EventKind::Moas).is_empty());
}
