//! Utility library for the bgpsentry project

pub mod as_path;
pub mod serde;

pub use as_path::{format_as_path, parse_as_path, AsPathError, Asn};
