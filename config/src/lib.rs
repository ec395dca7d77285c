//! # Kelp configuration library.
//!
//! This is the library code for reading and validating the configuration read
//! from an external data source. External data sources and their format are
//! handled through different loaders, see the [`loaders`] module for more
//! information.
//!
//! No matter which data source you use, ultimately all of them will load the
//! configuration as an instance of the [`Config`](config::Config) struct,
//! which is composed of other, more specialized, structs such as
//! [`Connections`](config::Connections) and [`Storage`](config::Storage).

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

pub mod config;
pub mod dirs;
pub mod loaders;
pub mod resolver;
