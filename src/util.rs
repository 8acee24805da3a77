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
//! Utility module collection of functions

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::Path,
};

use crate::Prefix;

const LOG_CONFIG: &str = "log4rs.yml";

/// Initialize logging from `log4rs.yml` if present in the working directory, and fall back to
/// `pretty_env_logger` (configured by `RUST_LOG`) otherwise.
pub fn init_logging() {
    if Path::new(LOG_CONFIG).exists() {
        if let Err(e) = log4rs::init_file(LOG_CONFIG, Default::default()) {
            eprintln!("Cannot initialize logging from {LOG_CONFIG}: {e}");
            pretty_env_logger::init();
        }
    } else {
        pretty_env_logger::init();
    }
}

/// Shard owning `prefix`, out of `num_shards`. All updates of one prefix always map to the same
/// shard.
pub fn shard_of(prefix: &Prefix, num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    (hasher.finish() % num_shards.max(1) as u64) as usize
}
