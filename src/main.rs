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
use std::path::PathBuf;

use clap::Parser;

use bgpsentry::{
    config::DetectorConfig,
    emitter::{EventSink, JsonLinesSink},
    pipeline::Pipeline,
    source,
    util,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
/// Detect routing anomalies in BGP update feeds and write them as JSON lines.
struct Args {
    /// Input feeds, given as `collector=path` (or just `path`, using the file name as the
    /// collector). Supported formats are CSV, JSON lines and MRT, optionally gzip-compressed.
    #[arg(required = true)]
    inputs: Vec<String>,
    /// JSON file with the detector configuration. Missing fields take their default value.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Write the anomaly records to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Write the final counters as JSON to this file.
    #[arg(long)]
    stats: Option<PathBuf>,
    /// Overwrite the window granularity in seconds.
    #[arg(long)]
    bucket_secs: Option<u64>,
    /// Overwrite the lateness tolerance in seconds.
    #[arg(long)]
    lateness_secs: Option<u64>,
    /// Overwrite the minimum number of corroborating peers.
    #[arg(long)]
    min_peers: Option<usize>,
    /// Overwrite the flap threshold.
    #[arg(long)]
    flap_threshold: Option<u64>,
    /// Overwrite the number of shard workers.
    #[arg(short = 'j', long)]
    shards: Option<usize>,
    /// Require peer corroboration for sub-prefix hijacks.
    #[arg(long)]
    subprefix_corroboration: bool,
}

impl Args {
    fn detector_config(&self) -> Result<DetectorConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => DetectorConfig::from_file(path)?,
            None => DetectorConfig::default(),
        };
        if let Some(x) = self.bucket_secs {
            config.bucket_secs = x;
        }
        if let Some(x) = self.lateness_secs {
            config.lateness_secs = x;
        }
        if let Some(x) = self.min_peers {
            config.min_peer_corroboration = x;
        }
        if let Some(x) = self.flap_threshold {
            config.flap_threshold = x;
        }
        if let Some(x) = self.shards {
            config.num_shards = x;
        }
        if self.subprefix_corroboration {
            config.subprefix_require_corroboration = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Split `collector=path` into its parts.
fn parse_input(input: &str) -> (String, PathBuf) {
    match input.split_once('=') {
        Some((collector, path)) => (collector.to_string(), PathBuf::from(path)),
        None => {
            let path = PathBuf::from(input);
            (source::default_collector(&path), path)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging();

    let args = Args::parse();
    let config = args.detector_config()?;
    log::debug!("Configuration: {config:?}");

    // open all inputs before starting, such that a typo does not leave a half-started pipeline
    let mut inputs = Vec::new();
    for input in &args.inputs {
        let (collector, path) = parse_input(input);
        let updates = source::open(&path, &collector)?;
        inputs.push((collector, updates));
    }

    let sink: Box<dyn EventSink> = match &args.output {
        Some(path) => Box::new(JsonLinesSink::create(path).await?),
        None => Box::new(JsonLinesSink::stdout()),
    };

    let mut pipeline = Pipeline::start(config, sink)?;
    for (collector, updates) in inputs {
        pipeline.spawn_source(collector, updates);
    }

    tokio::select! {
        _ = pipeline.wait_for_sources() => log::info!("All sources are exhausted"),
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("Interrupted");
        }
    }

    let snapshot = pipeline.shutdown().await?;
    if let Some(path) = &args.stats {
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
    }

    Ok(())
}
