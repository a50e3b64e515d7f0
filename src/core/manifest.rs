//! Project manifest (plz.toml) parsing and validation
//!
//! The manifest is an optional file describing what to bundle so the command
//! line can stay short. String values support `${VAR}` environment
//! substitution, and relative paths are resolved against the directory the
//! manifest lives in.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::defaults::{
    DEFAULT_BUILD_DIR, DEFAULT_PYTHON, DEFAULT_SANDBOX_NAME, FROZEN_FILENAME,
};
use crate::core::fingerprint::absolute;
use crate::core::pipeline::BuildConfig;
use crate::core::specifier::lenient_version;
use crate::error::ManifestError;

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
});

static SANDBOX_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex"));

/// The project manifest (plz.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// What to bundle and where
    #[serde(default)]
    pub package: PackageSection,

    /// Python dependencies
    #[serde(default)]
    pub python: PythonSection,

    /// System dependencies
    #[serde(default)]
    pub system: SystemSection,

    /// Archive filters
    #[serde(default)]
    pub archive: ArchiveSection,
}

/// `[package]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageSection {
    /// Sandbox name, also the base of the image name
    #[serde(default = "default_name")]
    pub name: String,

    /// Python version to build for
    #[serde(default = "default_python")]
    pub python: String,

    /// Files and directories to bundle
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Build directory
    #[serde(default = "default_build")]
    pub build: PathBuf,

    /// Artifact path, defaults to a zip inside the build directory
    #[serde(default)]
    pub artifact: Option<PathBuf>,

    /// Directory to store bundled files under
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_name() -> String {
    DEFAULT_SANDBOX_NAME.to_string()
}

fn default_python() -> String {
    DEFAULT_PYTHON.to_string()
}

fn default_build() -> PathBuf {
    PathBuf::from(DEFAULT_BUILD_DIR)
}

impl Default for PackageSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            python: default_python(),
            files: Vec::new(),
            build: default_build(),
            artifact: None,
            prefix: None,
        }
    }
}

/// `[python]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PythonSection {
    /// pip requirements files
    #[serde(default)]
    pub requirements: Vec<PathBuf>,

    /// pip constraints files
    #[serde(default)]
    pub constraints: Vec<PathBuf>,

    /// Extra arguments for pip install
    #[serde(default)]
    pub pip_args: Vec<String>,

    /// Write installed versions next to the artifact
    #[serde(default)]
    pub freeze: bool,
}

/// `[system]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemSection {
    /// System requirements document
    #[serde(default)]
    pub requirements: Option<PathBuf>,
}

/// `[archive]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArchiveSection {
    /// Extra names to leave out
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Extra suffixes to leave out
    #[serde(default)]
    pub ignore_filetypes: Vec<String>,
}

/// Substitute environment variables in a string using `${VAR}` syntax.
///
/// Unset variables become empty strings.
///
/// # Examples
/// ```
/// use plz::core::manifest::substitute_env_vars;
///
/// std::env::set_var("PLZ_DOC_VAR", "hello");
/// assert_eq!(substitute_env_vars("prefix_${PLZ_DOC_VAR}_suffix"), "prefix_hello_suffix");
/// std::env::remove_var("PLZ_DOC_VAR");
/// ```
pub fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Recursively substitute environment variables in a TOML value
fn substitute_in_value(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => *s = substitute_env_vars(s),
        toml::Value::Array(items) => items.iter_mut().for_each(substitute_in_value),
        toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| substitute_in_value(v)),
        _ => {}
    }
}

impl Manifest {
    /// Load, substitute, validate and resolve the manifest at `path`
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let parse_error = |error: String| ManifestError::Parse {
            path: path.to_path_buf(),
            error,
        };

        let mut value: toml::Value =
            toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
        substitute_in_value(&mut value);
        let manifest: Self = value.try_into().map_err(|e: toml::de::Error| parse_error(e.to_string()))?;

        manifest
            .validate()
            .map_err(|errors| parse_error(errors.join("; ")))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        tracing::debug!("Loaded manifest {}", path.display());
        Ok(manifest.resolved(base))
    }

    /// Load manifest from TOML string, without substitution or path resolution
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize manifest to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check field values, reporting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !SANDBOX_NAME.is_match(&self.package.name) {
            errors.push(format!(
                "Invalid package.name '{}': use letters, digits, '_', '.' or '-'",
                self.package.name
            ));
        }
        if lenient_version(&self.package.python).is_none() {
            errors.push(format!(
                "Invalid package.python '{}': expected a version like '3.9'",
                self.package.python
            ));
        }
        if self.package.build.as_os_str().is_empty() {
            errors.push("Field 'package.build' cannot be empty".to_string());
        }
        if self
            .archive
            .ignore_filetypes
            .iter()
            .any(|suffix| !suffix.starts_with('.'))
        {
            errors.push("Entries of 'archive.ignore_filetypes' must start with '.'".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Make every relative path relative to `base`
    fn resolved(mut self, base: &Path) -> Self {
        let package = &mut self.package;
        package.files = package.files.iter().map(|p| absolute(base, p)).collect();
        package.build = absolute(base, &package.build);
        package.artifact = package.artifact.as_deref().map(|p| absolute(base, p));

        let python = &mut self.python;
        python.requirements = python.requirements.iter().map(|p| absolute(base, p)).collect();
        python.constraints = python.constraints.iter().map(|p| absolute(base, p)).collect();

        self.system.requirements = self.system.requirements.as_deref().map(|p| absolute(base, p));
        self
    }

    /// Turn the manifest into a build configuration
    pub fn to_build_config(&self) -> BuildConfig {
        let config = BuildConfig::new(&self.package.build, &self.package.name)
            .with_files(self.package.files.clone())
            .with_requirements(self.python.requirements.clone())
            .with_constraints(self.python.constraints.clone())
            .with_system_requirements(self.system.requirements.clone())
            .with_pip_args(self.python.pip_args.clone())
            .with_ignore(
                self.archive.ignore.clone(),
                self.archive.ignore_filetypes.clone(),
            )
            .with_artifact(self.package.artifact.clone())
            .with_prefix(self.package.prefix.clone())
            .with_python_version(&self.package.python);

        if self.python.freeze {
            let freeze = frozen_path(&config.artifact_path());
            config.with_freeze(Some(freeze))
        } else {
            config
        }
    }
}

/// Freeze file written next to `artifact`
pub fn frozen_path(artifact: &Path) -> PathBuf {
    artifact
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(FROZEN_FILENAME)
}
