//! Error types for plz
//!
//! Domain-specific error types using thiserror. Each class maps to one kind of
//! build failure; all of them are fatal to the current build and trigger state
//! clearing in the pipeline before they propagate.

use std::path::PathBuf;
use thiserror::Error;

/// Sandbox executor errors (command failures and engine transport problems)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    /// A command inside the sandbox exited non-zero
    #[error("Command {command:?} failed in sandbox {sandbox} (exit code {exit_code}):\n{output}")]
    CommandFailed {
        sandbox: String,
        command: Vec<String>,
        exit_code: i32,
        output: String,
    },

    /// The container engine itself failed or was unreachable
    #[error("Container engine failed during {operation}: {message}")]
    Engine { operation: String, message: String },

    /// Neither Docker nor Podman could be found
    #[error("Neither Docker nor Podman found in PATH")]
    RuntimeNotFound,
}

/// Schema, sandbox identity or runtime version incompatibilities
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IncompatibleError {
    /// The sandbox image was built by an incompatible version of plz
    #[error("Mismatched image versions. Expected: {expected}. Found: {found}. Try rebuilding the image.")]
    ImageVersion { expected: String, found: String },

    /// The sandbox runs a different python than requested
    #[error("Mismatched python versions. Expected: {expected}. Found: {found}. Try rebuilding the image.")]
    RuntimeVersion { expected: String, found: String },

    /// The identity marker could not be read from the sandbox
    #[error("Could not read the identity marker of sandbox {sandbox}: {reason}")]
    MarkerUnreadable { sandbox: String, reason: String },

    /// The caller pinned a python version that is no longer supported
    #[error("Can't build for Python {version}: oldest supported Python is {minimum}")]
    UnsupportedRuntime { version: String, minimum: String },

    /// The system requirements document has an unknown schema tag
    #[error("Unsupported system requirements version {found} in '{path}' (supported: {supported})")]
    UnsupportedRequirementsVersion {
        path: PathBuf,
        found: i64,
        supported: i64,
    },
}

/// A name filter that should be unique matched several resources
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmbiguousError {
    /// Several containers or images share the name
    #[error("Multiple possible {kind}s named '{name}': {}", ids.join(", "))]
    MultipleMatches {
        kind: String,
        name: String,
        ids: Vec<String>,
    },
}

/// Results that cannot be trusted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    /// A package resolved to zero files to copy
    #[error("Package '{package}' resolved to zero files")]
    NoFiles { package: String },

    /// An installed requirement has no discoverable version
    #[error("Unable to work out installed version for '{requirement}'")]
    NoVersion { requirement: String },

    /// A fingerprint does not match the recorded one
    #[error("Fingerprint mismatch for '{path}': expected {expected}, got {actual}")]
    FingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The package manager printed a line we cannot parse
    #[error("Unable to parse installed package line {line:?}")]
    UnparseablePackageList { line: String },
}

/// Fingerprinting errors
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// A path vanished or could not be read mid-scan
    #[error("IO error fingerprinting '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Archive assembly errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// IO error while reading inputs or writing the archive
    #[error("IO error for '{path}': {error}")]
    Io { path: PathBuf, error: String },

    /// The zip writer rejected an entry
    #[error("Failed to write archive entry '{entry}': {error}")]
    Zip { entry: String, error: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to remove file
    #[error("Failed to remove file '{path}': {error}")]
    RemoveFile { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },
}

/// Manifest and requirement document errors
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The document could not be parsed
    #[error("Failed to parse '{path}': {error}")]
    Parse { path: PathBuf, error: String },

    /// The document could not be read
    #[error("Failed to read '{path}': {error}")]
    Read { path: PathBuf, error: String },
}

/// Top-level plz error type
#[derive(Error, Debug)]
pub enum PlzError {
    /// Sandbox executor error
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Incompatible state, sandbox or runtime
    #[error(transparent)]
    Incompatible(#[from] IncompatibleError),

    /// Ambiguous resource lookup
    #[error(transparent)]
    Ambiguous(#[from] AmbiguousError),

    /// Integrity error
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Fingerprint error
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// Archive error
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Filesystem error
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Manifest error
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
