//! Requirement documents
//!
//! Two inputs describe what goes into the bundle besides the caller's files:
//!
//! - a system requirements document (TOML) naming packages to install in the
//!   sandbox and which of their files to copy out
//! - pip-style requirements files, one requirement per line

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::config::defaults::SYSTEM_REQUIREMENTS_VERSION;
use crate::error::{IncompatibleError, ManifestError, PlzError};

/// Files to copy for one package: a single path or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSpec {
    /// One path
    One(String),
    /// Several paths (empty means discover by filetype)
    Many(Vec<String>),
}

impl FileSpec {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(path) => vec![path],
            Self::Many(paths) => paths,
        }
    }
}

/// Requested system packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageList {
    /// Plain list of names, files discovered by filetype
    Names(Vec<String>),
    /// Name to explicit file list
    Files(BTreeMap<String, FileSpec>),
}

impl Default for PackageList {
    fn default() -> Self {
        Self::Names(Vec::new())
    }
}

/// The caller-authored system requirements document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRequirements {
    /// Schema tag
    pub version: i64,

    /// Packages to install
    #[serde(default)]
    pub packages: PackageList,

    /// Suffixes of files to copy when no explicit list is given
    #[serde(default)]
    pub filetypes: Vec<String>,

    /// Packages never to install, removed if previously tracked
    #[serde(default)]
    pub skip: Vec<String>,

    /// Packages tracked even when the fresh sandbox already had them
    #[serde(default)]
    pub include: Vec<String>,
}

impl Default for SystemRequirements {
    fn default() -> Self {
        Self {
            version: SYSTEM_REQUIREMENTS_VERSION,
            packages: PackageList::default(),
            filetypes: Vec::new(),
            skip: Vec::new(),
            include: Vec::new(),
        }
    }
}

impl SystemRequirements {
    /// Parse from a TOML string, rejecting unknown schema versions
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, PlzError> {
        let document: Self = toml::from_str(content).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        if document.version != SYSTEM_REQUIREMENTS_VERSION {
            return Err(IncompatibleError::UnsupportedRequirementsVersion {
                path: path.to_path_buf(),
                found: document.version,
                supported: SYSTEM_REQUIREMENTS_VERSION,
            }
            .into());
        }

        Ok(document)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, PlzError> {
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content, path)
    }

    /// Names of the requested packages, in document order for lists
    pub fn names(&self) -> Vec<String> {
        match &self.packages {
            PackageList::Names(names) => names.clone(),
            PackageList::Files(files) => files.keys().cloned().collect(),
        }
    }

    /// Explicit file lists, keyed by package
    pub fn explicit_files(&self) -> BTreeMap<String, Vec<String>> {
        match &self.packages {
            PackageList::Names(_) => BTreeMap::new(),
            PackageList::Files(files) => files
                .iter()
                .map(|(name, spec)| (name.clone(), spec.clone().into_vec()))
                .filter(|(_, paths)| !paths.is_empty())
                .collect(),
        }
    }

    /// Requested names plus explicit includes
    pub fn include_set(&self) -> BTreeSet<String> {
        self.names()
            .into_iter()
            .chain(self.include.iter().cloned())
            .collect()
    }

    /// Names to skip
    pub fn skip_set(&self) -> BTreeSet<String> {
        self.skip.iter().cloned().collect()
    }

    /// Suffixes to discover
    pub fn filetype_set(&self) -> BTreeSet<String> {
        self.filetypes.iter().cloned().collect()
    }
}

/// One parsed line of a requirements file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `name[extras] <specifier> ; markers`
    Plain {
        name: String,
        specifier: String,
        line: String,
    },
    /// A VCS or URL requirement; the name is a best-effort guess
    Vcs { name_hint: String, line: String },
    /// Anything we could not make sense of, installed as-is
    Unparseable { raw: String },
}

static EGG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#egg=([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid regex"));

static DIRECT_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*@\s*\S+")
        .expect("valid regex")
});

static URL_PROJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/([A-Za-z0-9][A-Za-z0-9._-]*?)(?:\.git)?(?:@[^/#]*)?(?:#.*)?$")
        .expect("valid regex")
});

static PLAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*(.*)$")
        .expect("valid regex")
});

static NORMALIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_.]+").expect("valid regex"));

/// Canonical form of a project name (case and separator insensitive)
pub fn normalize_name(name: &str) -> String {
    NORMALIZE_RE.replace_all(&name.to_lowercase(), "-").to_string()
}

fn is_vcs(line: &str) -> bool {
    line.contains("://")
        || ["git+", "hg+", "svn+", "bzr+"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
        || DIRECT_REFERENCE_RE.is_match(line)
}

impl Requirement {
    /// Parse one line. Blank lines, comments and pip options yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        for flag in ["-e ", "--editable "] {
            if let Some(rest) = line.strip_prefix(flag) {
                line = rest.trim();
            }
        }
        if line.starts_with('-') {
            return None;
        }

        if is_vcs(line) {
            // `#egg=` is part of the URL, only whitespace-led `#` starts a comment
            let line = line.split(" #").next().unwrap_or(line).trim();
            let name_hint = EGG_RE
                .captures(line)
                .or_else(|| DIRECT_REFERENCE_RE.captures(line))
                .or_else(|| URL_PROJECT_RE.captures(line))
                .map(|caps| caps[1].to_string());

            return Some(match name_hint {
                Some(name_hint) => Self::Vcs {
                    name_hint,
                    line: line.to_string(),
                },
                None => Self::Unparseable {
                    raw: line.to_string(),
                },
            });
        }

        let line = line.split('#').next().unwrap_or(line).trim();
        let requirement = line.split(';').next().unwrap_or(line).trim();

        let parsed = PLAIN_RE.captures(requirement).and_then(|caps| {
            let name = caps[1].to_string();
            let specifier = caps[2]
                .trim()
                .trim_start_matches('(')
                .trim_end_matches(')')
                .trim()
                .to_string();
            let valid = specifier.is_empty()
                || specifier.starts_with(['<', '>', '=', '!', '~']);
            valid.then_some((name, specifier))
        });

        Some(match parsed {
            Some((name, specifier)) => Self::Plain {
                name,
                specifier,
                line: line.to_string(),
            },
            None => Self::Unparseable {
                raw: line.to_string(),
            },
        })
    }

    /// Key the installed version is tracked under
    pub fn key(&self) -> String {
        match self {
            Self::Plain { name, .. } => normalize_name(name),
            Self::Vcs { name_hint, .. } => normalize_name(name_hint),
            Self::Unparseable { raw } => raw.clone(),
        }
    }

    /// Argument handed to pip
    pub fn install_arg(&self) -> &str {
        match self {
            Self::Plain { line, .. } | Self::Vcs { line, .. } => line,
            Self::Unparseable { raw } => raw,
        }
    }

    /// Project name to query, if known
    pub fn project_name(&self) -> Option<&str> {
        match self {
            Self::Plain { name, .. } => Some(name),
            Self::Vcs { name_hint, .. } => Some(name_hint),
            Self::Unparseable { .. } => None,
        }
    }
}

/// Read every requirement from a set of requirements files, in order
pub fn read_requirements<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Requirement>, ManifestError> {
    let mut requirements = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        requirements.extend(content.lines().filter_map(Requirement::parse));
    }
    Ok(requirements)
}
