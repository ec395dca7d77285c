//! The `util` package contains small helpers that are shared across the Kelp
//! node crates.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

/// Atomic file writing
pub mod files;

/// Timestamp as UTC
pub mod timestamp;
