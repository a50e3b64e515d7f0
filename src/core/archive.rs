//! Archive assembler
//!
//! Serializes caller files and stage outputs into the final zip. Entries are
//! keyed by their path relative to the root they were found under, so the same
//! relative path from a later root replaces an earlier one. Timestamps are
//! fixed, which keeps the archive byte-identical for identical inputs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::config::defaults::{IGNORE, IGNORE_FILETYPES};
use crate::error::ArchiveError;

/// What to leave out of the archive and where to put the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// Directory prepended to every stored path
    pub prefix: Option<String>,
    /// Names or relative paths to skip
    pub ignore: BTreeSet<String>,
    /// Suffixes to skip
    pub ignore_filetypes: BTreeSet<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            ignore: IGNORE.iter().map(|s| (*s).to_string()).collect(),
            ignore_filetypes: IGNORE_FILETYPES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl ArchiveOptions {
    /// Store everything under `prefix`
    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        self
    }

    /// Skip these names in addition to the defaults
    pub fn with_ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(names.into_iter().map(Into::into));
        self
    }

    /// Skip these suffixes in addition to the defaults
    pub fn with_ignore_filetypes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_filetypes
            .extend(suffixes.into_iter().map(Into::into));
        self
    }
}

fn io_error(path: &Path, error: impl ToString) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}

/// Relative path with forward slashes
fn archive_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn suffix(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
}

/// Enumerate the files to store, keyed by stored name
pub fn collect_entries(
    roots: &[PathBuf],
    options: &ArchiveOptions,
) -> Result<BTreeMap<String, PathBuf>, ArchiveError> {
    let mut entries = BTreeMap::new();
    let mut remaining = VecDeque::new();

    for root in roots {
        let root = std::path::absolute(root).map_err(|e| io_error(root, e))?;
        let relative_to = root.parent().map_or_else(|| root.clone(), Path::to_path_buf);
        remaining.push_back((root, relative_to));
    }

    while let Some((path, relative_to)) = remaining.pop_front() {
        let relative = path.strip_prefix(&relative_to).unwrap_or(&path);
        let destination = archive_name(relative);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if options.ignore.contains(&name)
            || options.ignore.contains(&destination)
            || suffix(&path).is_some_and(|s| options.ignore_filetypes.contains(&s))
        {
            tracing::debug!("Ignoring {}", path.display());
            continue;
        }

        if path.is_dir() {
            let mut children = std::fs::read_dir(&path)
                .map_err(|e| io_error(&path, e))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| io_error(&path, e))?;
            children.sort();
            remaining.extend(children.into_iter().map(|child| (child, relative_to.clone())));
        } else {
            let stored = match &options.prefix {
                Some(prefix) => format!("{prefix}/{destination}"),
                None => destination,
            };
            if let Some(previous) = entries.insert(stored.clone(), path) {
                tracing::debug!("{} replaces {} in the archive", stored, previous.display());
            }
        }
    }

    Ok(entries)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

/// Write every file under `roots` into a zip at `destination`.
///
/// The archive is written next to `destination` and moved into place once
/// complete. Returns the number of stored entries.
pub fn write_archive(
    destination: &Path,
    roots: &[PathBuf],
    options: &ArchiveOptions,
) -> Result<usize, ArchiveError> {
    let entries = collect_entries(roots, options)?;

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    let temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(parent, e))?;

    let mut writer = ZipWriter::new(temp.as_file());
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());

    for (name, path) in &entries {
        tracing::debug!("Archiving {} to {}", path.display(), name);
        let options = match file_mode(path) {
            Some(mode) => base.unix_permissions(mode),
            None => base,
        };
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| ArchiveError::Zip {
                entry: name.clone(),
                error: e.to_string(),
            })?;
        let mut reader = BufReader::new(File::open(path).map_err(|e| io_error(path, e))?);
        std::io::copy(&mut reader, &mut writer).map_err(|e| io_error(path, e))?;
    }

    writer.finish().map_err(|e| ArchiveError::Zip {
        entry: destination.display().to_string(),
        error: e.to_string(),
    })?;
    temp.persist(destination)
        .map_err(|e| io_error(destination, e.error))?;

    tracing::info!("Wrote {} entries to {}", entries.len(), destination.display());
    Ok(entries.len())
}
