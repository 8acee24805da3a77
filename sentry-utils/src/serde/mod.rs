//! Utility module for serde of types found in decoded route-collector feeds.

pub mod as_path;
pub mod epoch_secs;
