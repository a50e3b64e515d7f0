//! Build state store
//!
//! The state document records what the previous build produced: input
//! fingerprints per stage, the sandbox it used, the package inventories it
//! layered on top of that sandbox, and the hash of the artifact it wrote.
//!
//! Loading never fails. A missing, unreadable, unparsable or foreign-schema
//! document means "never built". Saving always rewrites the whole document
//! atomically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::defaults::STATE_SCHEMA_VERSION;
use crate::core::fingerprint::FileSetFingerprint;
use crate::core::inventory::{BaselineInventory, InstalledInventory, PackageVersions};
use crate::core::stages::Tier;
use crate::error::FilesystemError;
use crate::infra::filesystem;

/// Identity of the sandbox a build ran in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIdentity {
    /// Engine id of the sandbox
    pub id: String,
    /// Creation timestamp reported by the engine
    pub created_at: String,
    /// Image marker version the sandbox was created from
    pub base_version: String,
    /// Python version inside the sandbox
    pub runtime_version: String,
}

/// Everything remembered between builds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    /// Document schema version
    pub schema_version: String,

    /// Fingerprint of the bundled caller files
    #[serde(default)]
    pub files: FileSetFingerprint,

    /// Fingerprint of the python requirements files
    #[serde(default)]
    pub requirements: FileSetFingerprint,

    /// Fingerprint of the python constraints files
    #[serde(default)]
    pub constraints: FileSetFingerprint,

    /// Fingerprint of the system requirements document
    #[serde(default)]
    pub system_requirements: FileSetFingerprint,

    /// Archive prefix the artifact was written with
    #[serde(default)]
    pub prefix: Option<String>,

    /// Sandbox the inventories below refer to
    #[serde(default)]
    pub sandbox: Option<SandboxIdentity>,

    /// Packages the sandbox had before anything was installed
    #[serde(default)]
    pub base_packages: BaselineInventory,

    /// Python packages installed, name to version
    #[serde(default)]
    pub python_packages: PackageVersions,

    /// System packages copied, with their files
    #[serde(default)]
    pub system_packages: InstalledInventory,

    /// SHA256 of the artifact written by the last successful bundle stage
    #[serde(default)]
    pub artifact_hash: Option<String>,

    /// Tiers whose last run finished
    #[serde(default)]
    pub completed: BTreeSet<Tier>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION.to_string(),
            files: FileSetFingerprint::default(),
            requirements: FileSetFingerprint::default(),
            constraints: FileSetFingerprint::default(),
            system_requirements: FileSetFingerprint::default(),
            prefix: None,
            sandbox: None,
            base_packages: BaselineInventory::default(),
            python_packages: PackageVersions::default(),
            system_packages: InstalledInventory::default(),
            artifact_hash: None,
            completed: BTreeSet::new(),
        }
    }
}

impl BuildState {
    /// Load the state at `path`, falling back to the empty state
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No build state at {}", path.display());
                return Self::default();
            }
            Err(e) => {
                tracing::warn!("Could not read build state {}: {}", path.display(), e);
                return Self::default();
            }
        };

        Self::from_json(&content).unwrap_or_else(|| {
            tracing::info!(
                "Build state at {} is unusable, treating as never built",
                path.display()
            );
            Self::default()
        })
    }

    /// Parse a state document, `None` when it is invalid or from another schema
    pub fn from_json(content: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(content).ok()?;

        let found = value.get("schema_version").and_then(|v| v.as_str());
        if found != Some(STATE_SCHEMA_VERSION) {
            tracing::info!(
                "Build state has incompatible version (expected {}, found {:?})",
                STATE_SCHEMA_VERSION,
                found
            );
            return None;
        }

        serde_json::from_value(value).ok()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Rewrite the whole document at `path`
    pub fn save(&self, path: &Path) -> Result<(), FilesystemError> {
        let content = self.to_json().map_err(|e| FilesystemError::WriteFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        filesystem::write_file_atomic(path, content.as_bytes())
    }

    /// Record that `tier` finished
    pub fn complete(&mut self, tier: Tier) {
        self.completed.insert(tier);
    }

    /// Whether the last run of `tier` finished
    pub fn is_complete(&self, tier: Tier) -> bool {
        self.completed.contains(&tier)
    }

    /// Forget everything recorded for one tier
    pub fn reset_tier(&mut self, tier: Tier) {
        self.completed.remove(&tier);
        match tier {
            Tier::Base => {
                self.sandbox = None;
                self.base_packages = BaselineInventory::default();
            }
            Tier::System => {
                self.system_requirements = FileSetFingerprint::default();
                self.system_packages = InstalledInventory::default();
            }
            Tier::Python => {
                self.requirements = FileSetFingerprint::default();
                self.constraints = FileSetFingerprint::default();
                self.python_packages = PackageVersions::default();
            }
            Tier::Bundle => {
                self.files = FileSetFingerprint::default();
                self.prefix = None;
                self.artifact_hash = None;
            }
        }
    }

    /// Forget `tier` and everything built on top of it
    pub fn invalidate_from(&mut self, tier: Tier) {
        for affected in tier.with_dependents() {
            self.reset_tier(affected);
        }
    }
}
