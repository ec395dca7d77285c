//! Loaders for reading a [`Config`](crate::config::Config) instance out of
//! different data sources.

pub mod toml;
