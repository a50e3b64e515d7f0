//! Package registry diff engine
//!
//! Works out which system packages changed in the sandbox relative to what the
//! sandbox started with and what was already copied, then applies that delta
//! to the shared output area: stale files are removed, new files copied, and
//! the installed inventory updated to match.
//!
//! Files are the source of truth. A crash between removing files and updating
//! the inventory is harmless because the next run re-reads the live package
//! list from the sandbox.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::config::paths::SYSTEM_INSTALL_PATH;
use crate::core::inventory::{BaselineInventory, InstalledInventory, InstalledPackage, PackageVersions};
use crate::error::{IntegrityError, PlzError};
use crate::infra::executor::SandboxSession;

/// Command listing every installed package
pub const LIST_INSTALLED: &[&str] = &["yum", "list", "installed"];

/// Line separating the package manager preamble from the package table
const INSTALLED_HEADER: &str = "Installed Packages";

static PACKAGE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\s]+(?:\.[\w_]+))\s+(\w+(?:[.:_-]\w+)*)\s+(@\w+(?:-\w+)*)\s*$")
        .expect("valid regex")
});

static PARTIAL_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s]+(?:\.[\w_]+)+(?:\s+\w+(?:[.:_-]\w+)*)?\s*$").expect("valid regex")
});

/// Parse `yum list installed` output into name to version.
///
/// Long package names push columns onto the next line; such partial lines
/// are joined with their continuation before matching.
pub fn parse_installed_packages(output: &str) -> Result<PackageVersions, IntegrityError> {
    let mut packages = PackageVersions::new();
    let mut finished_header = false;
    let mut partial: Option<String> = None;

    for line in output.lines() {
        if !finished_header {
            finished_header = line.trim() == INSTALLED_HEADER;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let line = match partial.take() {
            Some(start) => format!("{start} {}", line.trim()),
            None => line.to_string(),
        };

        if let Some(caps) = PACKAGE_LINE_RE.captures(&line) {
            // drop the architecture suffix, keep the repo out of it
            let qualified = &caps[1];
            let name = qualified
                .rsplit_once('.')
                .map_or(qualified, |(name, _arch)| name);
            packages.insert(name, &caps[2]);
        } else if PARTIAL_LINE_RE.is_match(&line) {
            partial = Some(line.trim_end().to_string());
        } else {
            return Err(IntegrityError::UnparseablePackageList { line });
        }
    }

    if let Some(line) = partial {
        return Err(IntegrityError::UnparseablePackageList { line });
    }

    Ok(packages)
}

/// Query the full list of packages currently installed in the sandbox
pub fn list_installed(session: &mut SandboxSession<'_>) -> Result<PackageVersions, PlzError> {
    tracing::info!("Checking which packages are installed in {}", session.id());
    let output = session.run(LIST_INSTALLED)?;
    Ok(parse_installed_packages(&output)?)
}

/// How a live package differs from what is recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Not tracked and not part of the baseline (or explicitly included)
    New,
    /// Tracked or baseline package now at a different version
    Updated { previous: String },
    /// Tracked package at the same version whose requested files changed
    Reselected,
}

/// A package whose files must be (re)copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageChange {
    /// Package name
    pub name: String,
    /// Live version in the sandbox
    pub version: String,
    /// What kind of change this is
    pub kind: ChangeKind,
}

/// Compare the live package list against the baseline and installed inventory.
///
/// Tracked packages are judged against their tracked version only; the
/// baseline is consulted for untracked names.
pub fn classify(
    baseline: &BaselineInventory,
    installed: &InstalledInventory,
    live: &PackageVersions,
    skip: &BTreeSet<String>,
    include: &BTreeSet<String>,
) -> Vec<PackageChange> {
    let mut changes = Vec::new();

    for (name, version) in live.iter() {
        if skip.contains(name) {
            continue;
        }

        let kind = if let Some(tracked) = installed.get(name) {
            if &tracked.version == version {
                continue;
            }
            ChangeKind::Updated {
                previous: tracked.version.clone(),
            }
        } else if !baseline.contains(name) || include.contains(name) {
            ChangeKind::New
        } else {
            match baseline.get(name) {
                Some(base) if base != version => ChangeKind::Updated {
                    previous: base.to_string(),
                },
                _ => continue,
            }
        };

        changes.push(PackageChange {
            name: name.clone(),
            version: version.clone(),
            kind,
        });
    }

    changes
}

/// File suffixes of a path, like `.so`, `.5` for `libpq.so.5`
fn suffixes(path: &str) -> Vec<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.ends_with('.') {
        return Vec::new();
    }
    let stem = name.trim_start_matches('.');
    let starts: Vec<usize> = stem.match_indices('.').map(|(i, _)| i).collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(stem.len());
            &stem[start..end]
        })
        .collect()
}

/// Whether a file's outermost or first suffix is wanted.
///
/// Matching the first suffix keeps versioned shared objects (`libfoo.so.1.2`).
pub fn wanted_filetype(path: &str, filetypes: &BTreeSet<String>) -> bool {
    let found = suffixes(path);
    match (found.first(), found.last()) {
        (Some(first), Some(last)) => filetypes.contains(*last) || filetypes.contains(*first),
        _ => false,
    }
}

/// Whether a tracked package's files were chosen the way `request` would choose them
fn selection_matches(name: &str, tracked: &InstalledPackage, request: &DiffRequest) -> bool {
    match request.explicit_files.get(name) {
        Some(files) => tracked.filetypes.is_empty() && &tracked.files == files,
        None => !tracked.filetypes.is_empty() && tracked.filetypes == request.filetypes,
    }
}

/// Everything the diff needs besides the sandbox and the installed inventory
#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    /// Packages the fresh sandbox already had
    pub baseline: BaselineInventory,
    /// Explicit file lists per package
    pub explicit_files: BTreeMap<String, Vec<String>>,
    /// Suffixes to discover when no explicit list is given
    pub filetypes: BTreeSet<String>,
    /// Packages to remove and never track
    pub skip: BTreeSet<String>,
    /// Packages tracked even at their baseline version
    pub include: BTreeSet<String>,
    /// Packages the caller asked for by name
    pub requested: BTreeSet<String>,
}

/// Result of applying a diff
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    /// Inventory after the diff
    pub inventory: InstalledInventory,
    /// Every file copied during this diff
    pub copied: Vec<String>,
}

/// Output-area path a sandbox file is copied to
fn output_path(file: &str) -> String {
    let name = file.rsplit('/').next().unwrap_or(file);
    format!("{SYSTEM_INSTALL_PATH}/{name}")
}

/// Remove previously copied files. Failures are logged, a file may already be gone.
fn remove_files(session: &mut SandboxSession<'_>, files: &[String]) {
    for file in files {
        let target = output_path(file);
        match session.probe(&["rm", "-rf", &target]) {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::warn!(
                "Failed to delete file {} (exit code {}): {}",
                target,
                output.exit_code,
                output.stderr.trim()
            ),
            Err(e) => tracing::warn!("Failed to delete file {}: {}", target, e),
        }
    }
}

/// Ask the package manager which files a package owns, keeping wanted ones that exist
fn discover_files(
    session: &mut SandboxSession<'_>,
    name: &str,
    filetypes: &BTreeSet<String>,
) -> Result<Vec<String>, PlzError> {
    if filetypes.is_empty() {
        return Ok(Vec::new());
    }

    let listing = session.run(&["repoquery", "--list", name])?;
    let mut files = Vec::new();
    for file in listing.lines().map(str::trim).filter(|f| !f.is_empty()) {
        if !wanted_filetype(file, filetypes) {
            continue;
        }
        // the owned-file query can list files that are not installed
        if !session.probe(&["ls", "-L", file])?.success() {
            tracing::debug!("Skipping {} listed for {} but not present", file, name);
            continue;
        }
        files.push(file.to_string());
    }
    Ok(files)
}

/// Apply the delta between the sandbox and `installed` to the output area
pub fn apply(
    session: &mut SandboxSession<'_>,
    mut installed: InstalledInventory,
    request: &DiffRequest,
) -> Result<DiffOutcome, PlzError> {
    for name in &request.skip {
        if let Some(package) = installed.get(name).cloned() {
            tracing::info!("Removing skipped package {}", name);
            remove_files(session, &package.files);
            installed.remove(name);
        }
    }

    let live = list_installed(session)?;
    let mut changes = classify(
        &request.baseline,
        &installed,
        &live,
        &request.skip,
        &request.include,
    );
    for (name, tracked) in installed.iter() {
        let Some(version) = live.get(name) else {
            continue;
        };
        if request.skip.contains(name)
            || changes.iter().any(|change| &change.name == name)
            || selection_matches(name, tracked, request)
        {
            continue;
        }
        changes.push(PackageChange {
            name: name.clone(),
            version: version.to_string(),
            kind: ChangeKind::Reselected,
        });
    }

    let mut copied = Vec::new();
    for change in changes {
        match &change.kind {
            ChangeKind::New => tracing::info!("Installed {} ({})", change.name, change.version),
            ChangeKind::Updated { previous } => tracing::info!(
                "Updated {} ({} -> {})",
                change.name,
                previous,
                change.version
            ),
            ChangeKind::Reselected => tracing::info!(
                "Recopying {} ({}), its file list changed",
                change.name,
                change.version
            ),
        }

        // old files go before new ones land under the same name
        if let Some(previous) = installed.remove(&change.name) {
            remove_files(session, &previous.files);
        }

        let (files, filetypes) = match request.explicit_files.get(&change.name) {
            Some(files) => (files.clone(), BTreeSet::new()),
            None => (
                discover_files(session, &change.name, &request.filetypes)?,
                request.filetypes.clone(),
            ),
        };

        for file in &files {
            // follow a symlink named directly, not ones found while recursing
            session.run(&["cp", "-R", "-H", file, SYSTEM_INSTALL_PATH])?;
        }

        if files.is_empty() {
            if request.requested.contains(&change.name) {
                return Err(IntegrityError::NoFiles {
                    package: change.name,
                }
                .into());
            }
            tracing::debug!("No files to copy for {}, not tracking it", change.name);
            continue;
        }

        copied.extend(files.iter().cloned());
        installed.insert(
            change.name,
            InstalledPackage {
                version: change.version,
                files,
                filetypes,
            },
        );
    }

    Ok(DiffOutcome {
        inventory: installed,
        copied,
    })
}
