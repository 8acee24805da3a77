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
//! Check update feeds offline: report which updates would be rejected, which would arrive late,
//! and optionally which anomalies the detectors report on them.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use strum::IntoEnumIterator;

use bgpsentry::{
    config::DetectorConfig,
    engine::Engine,
    event::{AnomalyEvent, EventKind},
    prefix_index::PrefixIndex,
    source, util,
    window::LateReason,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Input feeds (CSV, JSON lines or MRT, optionally gzip-compressed). They are processed one
    /// after the other by a single engine.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// JSON file with the detector configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Print the summary of every detected anomaly.
    #[arg(short, long)]
    detect: bool,
    /// Print up to this many rejected updates per error kind.
    #[arg(short = 'n', long, default_value_t = 3)]
    examples_per_kind: usize,
}

fn main() -> anyhow::Result<()> {
    util::init_logging();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DetectorConfig::from_file(path)
            .with_context(|| format!("Cannot read the configuration from {path:?}"))?,
        None => DetectorConfig::default(),
    };
    let mut engine = Engine::new(config).context("Invalid configuration")?;

    let mut unreadable = 0u64;
    let mut rejected: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    let mut anomalies: BTreeMap<EventKind, usize> = BTreeMap::new();
    let mut report = |events: Vec<AnomalyEvent>| {
        for event in events {
            if args.detect {
                println!("{}", event.summary());
            }
            *anomalies.entry(event.kind()).or_default() += 1;
        }
    };

    for path in &args.inputs {
        let updates = source::open(path, &source::default_collector(path))
            .with_context(|| format!("Cannot open the input {path:?}"))?;
        for update in updates {
            let raw = match update {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Unreadable entry in {path:?}: {e}");
                    unreadable += 1;
                    continue;
                }
            };
            match engine.ingest(&raw) {
                Ok(events) => report(events),
                Err(e) => rejected.entry(e.kind()).or_default().push(e.to_string()),
            }
        }
    }
    report(engine.flush());

    let counters = engine.counters();
    println!("updates:    {}", counters.updates + counters.validation_errors);
    println!("unreadable: {unreadable}");
    println!("rejected:   {}", counters.validation_errors);
    for (kind, errors) in &rejected {
        println!("  {kind}: {}", errors.len());
        for error in errors.iter().take(args.examples_per_kind) {
            println!("    {error}");
        }
    }
    let late = engine.late();
    println!("late:       {}", late.total());
    for reason in LateReason::iter() {
        println!("  {reason}: {}", late.count(reason));
    }
    let nesting = Nesting::of(engine.index());
    println!("prefixes:   {}", engine.index().len());
    println!("  covered:  {}", nesting.covered);
    println!("  covering: {}", nesting.covering);
    println!("  depth:    {}", nesting.max_depth);
    println!("anomalies:  {}", anomalies.values().sum::<usize>());
    for kind in EventKind::iter() {
        println!("  {kind}: {}", anomalies.get(&kind).copied().unwrap_or_default());
    }

    Ok(())
}

/// How the observed prefixes nest into each other.
#[derive(Debug, Default)]
struct Nesting {
    /// Prefixes with at least one covering parent.
    covered: usize,
    /// Prefixes with at least one more-specific.
    covering: usize,
    /// Largest number of covering parents of any prefix.
    max_depth: usize,
}

impl Nesting {
    fn of(index: &PrefixIndex) -> Self {
        let mut nesting = Self::default();
        for entry in index.entries() {
            let depth = index.covering_parents(&entry.prefix).len();
            if depth > 0 {
                nesting.covered += 1;
            }
            if !index.more_specifics(&entry.prefix).is_empty() {
                nesting.covering += 1;
            }
            nesting.max_depth = nesting.max_depth.max(depth);
        }
        nesting
    }
}
