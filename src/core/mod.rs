//! Core build logic
//!
//! Everything that decides what to rebuild and how lives here. Talking to the
//! container engine goes through [`crate::infra::executor::SandboxExecutor`].
//!
//! # Submodules
//!
//! - [`pipeline`] - Layered build orchestration
//! - [`stages`] - Tier arena and dirty tracking
//! - [`state`] - Persisted build state
//! - [`lifecycle`] - Sandbox reuse, creation and teardown
//! - [`diff`] - System package diffing against the sandbox baseline
//! - [`inventory`] - Package inventories
//! - [`requirements`] - Requirement documents
//! - [`specifier`] - Python version specifiers
//! - [`fingerprint`] - Content hashing
//! - [`archive`] - Zip assembly
//! - [`manifest`] - Project manifest (plz.toml)

pub mod archive;
pub mod diff;
pub mod fingerprint;
pub mod inventory;
pub mod lifecycle;
pub mod manifest;
pub mod pipeline;
pub mod requirements;
pub mod specifier;
pub mod stages;
pub mod state;
