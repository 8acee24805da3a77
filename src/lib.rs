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
//! Library for detecting routing-security anomalies (origin hijacks, sub-prefix hijacks, MOAS
//! conflicts, AS-path loops and route flaps) in a live stream of BGP updates.
//!
//! Updates flow through the following stages:
//!
//! 1. [`normalizer`] validates a [`records::RawUpdate`] into an [`records::UpdateRecord`].
//! 2. [`window::WindowManager`] looks the prefix up in the [`prefix_index::PrefixIndex`] and
//!    applies the update to the prefix's open window, sealing windows once the watermark passes
//!    their end.
//! 3. [`engine::Evaluator`] runs all [`detectors`] on a sealed window and archives it into
//!    the prefix's baseline.
//! 4. [`emitter::Emitter`] deduplicates the resulting [`event::AnomalyEvent`]s and hands them to
//!    an [`emitter::EventSink`].
//!
//! [`engine::Engine`] drives these stages from a single owner, [`pipeline::Pipeline`] runs them
//! on sharded tokio tasks.

/// Autonomous system number.
pub type Asn = sentry_utils::Asn;

/// Index of a time bucket, i.e., `floor(timestamp / bucket_duration)`.
pub type Bucket = i64;

/// Prefix type used throughout this crate.
pub type Prefix = ipnet::IpNet;

pub mod config;
pub mod detectors;
pub mod emitter;
pub mod engine;
pub mod event;
pub mod normalizer;
pub mod pipeline;
pub mod prefix_index;
pub mod records;
pub mod source;
pub mod state;
pub mod stats;
pub mod util;
pub mod window;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        config::{BackpressurePolicy, DetectorConfig, EmitterConfig},
        emitter::{EventSink, JsonLinesSink, MemorySink},
        engine::Engine,
        event::{AnomalyEvent, EventKind},
        pipeline::Pipeline,
        records::{AnalysisRecord, PeerId, RawUpdate, UpdateKind, UpdateRecord},
        Asn, Bucket, Prefix,
    };
}
