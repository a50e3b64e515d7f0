//! Package inventories
//!
//! A baseline inventory lists what a fresh sandbox already had; the installed
//! inventory tracks what plz layered on top, together with the files it
//! copied for each package.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Package name to version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageVersions(BTreeMap<String, String>);

/// Packages present in a sandbox before plz installed anything
pub type BaselineInventory = PackageVersions;

impl PackageVersions {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Version recorded for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether `name` is recorded
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Record a version, returning the previous one
    pub fn insert(&mut self, name: impl Into<String>, version: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), version.into())
    }

    /// Drop a package
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    /// Iterate over `(name, version)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for PackageVersions {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A package plz installed and the files it copied for it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Installed version
    pub version: String,

    /// Paths inside the sandbox that were copied to the output area
    #[serde(default)]
    pub files: Vec<String>,

    /// Suffixes the files were discovered by, empty for an explicit list
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub filetypes: BTreeSet<String>,
}

/// Packages layered on top of the baseline, persisted between builds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledInventory(BTreeMap<String, InstalledPackage>);

impl InstalledInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `name`
    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.0.get(name)
    }

    /// Whether `name` is tracked
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Track a package. Callers must not record a package without files.
    pub fn insert(&mut self, name: impl Into<String>, package: InstalledPackage) {
        self.0.insert(name.into(), package);
    }

    /// Stop tracking a package
    pub fn remove(&mut self, name: &str) -> Option<InstalledPackage> {
        self.0.remove(name)
    }

    /// Tracked package names
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Iterate over tracked packages in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstalledPackage)> {
        self.0.iter()
    }

    /// Number of tracked packages
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
