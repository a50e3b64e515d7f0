//! plz - layered, cache-aware bundler
//!
//! Packages python code together with its native and python dependencies into
//! a single zip. Dependencies are installed inside a disposable container
//! sandbox and every stage of the build is cached against content
//! fingerprints, so an unchanged project rebuilds nothing.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Build pipeline, sandbox lifecycle and package diffing
//! - [`infra`] - Container engine and filesystem access
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
