//! Infrastructure layer
//!
//! Handles I/O with the outside world: the container engine and the host
//! filesystem.

pub mod docker;
pub mod executor;
pub mod filesystem;
