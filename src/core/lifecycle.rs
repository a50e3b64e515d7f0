//! Sandbox lifecycle manager
//!
//! Decides whether the sandbox left behind by a previous build can be reused.
//! An existing sandbox is only trusted when the build state recorded its exact
//! id and creation time and its image marker matches this version of plz and
//! the requested python. Anything else is stale and gets recreated. A freshly
//! created sandbox records its pre-existing packages as the baseline.
//!
//! Validation only reads from the engine, so reusing a sandbox mutates nothing
//! until a stage actually needs it running.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::defaults::{
    BASE_IMAGE_TEMPLATE, BOOTSTRAP_PACKAGES, IMAGE_MARKER_VERSION, MAX_PYTHON_VERSION,
    MIN_PYTHON_VERSION,
};
use crate::config::paths::{HOME_PATH, IMAGE_MARKER_PATH, INSTALL_PATH, PYTHON_INSTALL_PATH};
use crate::core::diff;
use crate::core::specifier::lenient_version;
use crate::core::state::{BuildState, SandboxIdentity};
use crate::core::stages::Tier;
use crate::error::{AmbiguousError, IncompatibleError, PlzError};
use crate::infra::executor::{
    ImageSpec, ListFilter, MountConfig, ResourceKind, SandboxExecutor, SandboxSession,
};

/// Identity marker baked into every base image
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageMarker {
    pub version: String,
    pub python: String,
}

/// What validation found for the named sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxStatus {
    /// No sandbox with this name exists
    Absent,
    /// A sandbox exists but cannot be trusted
    Stale { id: String, running: bool, reason: String },
    /// The recorded sandbox, untouched since the last build
    Reusable { id: String, running: bool },
}

/// A sandbox ready for the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Engine id
    pub id: String,
    /// Created during this build
    pub fresh: bool,
    /// Currently running
    pub running: bool,
}

/// Check the requested python against the supported range.
///
/// Newer than anything known only warns; older than the oldest supported is a
/// configuration error.
pub fn check_runtime(version: &str) -> Result<(), IncompatibleError> {
    let unsupported = || IncompatibleError::UnsupportedRuntime {
        version: version.to_string(),
        minimum: MIN_PYTHON_VERSION.to_string(),
    };

    let requested = lenient_version(version).ok_or_else(unsupported)?;
    if lenient_version(MIN_PYTHON_VERSION).is_some_and(|minimum| requested < minimum) {
        return Err(unsupported());
    }
    if lenient_version(MAX_PYTHON_VERSION).is_some_and(|maximum| requested > maximum) {
        tracing::warn!(
            "Python version ({}) is greater than the latest known supported version: {}",
            version,
            MAX_PYTHON_VERSION
        );
    }
    Ok(())
}

/// Dockerfile for the base image of `python`
pub fn base_dockerfile(python: &str) -> String {
    let base = BASE_IMAGE_TEMPLATE.replace("{version}", python);
    let marker = serde_json::json!({ "version": IMAGE_MARKER_VERSION, "python": python });
    format!(
        "FROM {base}\n\
         RUN export PYTHONPATH={PYTHON_INSTALL_PATH} && pip install --upgrade pip\n\
         RUN echo '{marker}' > {IMAGE_MARKER_PATH}\n\
         ENV HOME {HOME_PATH}\n"
    )
}

/// Whether the image needs EPEL enabled before yum-utils installs
fn needs_epel(python: &str) -> bool {
    match (lenient_version(python), lenient_version("3.8")) {
        (Some(requested), Some(threshold)) => requested >= threshold,
        _ => false,
    }
}

/// Finds, validates, creates and stops the named sandbox
pub struct SandboxManager<'e> {
    executor: &'e mut dyn SandboxExecutor,
    name: String,
    python: String,
    build_dir: PathBuf,
    started: Option<String>,
}

impl<'e> SandboxManager<'e> {
    /// Manage the sandbox `name` for `python`, binding `build_dir` into it
    pub fn new(
        executor: &'e mut dyn SandboxExecutor,
        name: impl Into<String>,
        python: impl Into<String>,
        build_dir: &Path,
    ) -> Self {
        Self {
            executor,
            name: name.into(),
            python: python.into(),
            build_dir: build_dir.to_path_buf(),
            started: None,
        }
    }

    /// Name (with tag) of the base image sandboxes are created from
    pub fn image_name(&self) -> String {
        format!("{}-base:{}", self.name, self.python)
    }

    /// A command session on sandbox `id`
    pub fn session(&mut self, id: &str) -> SandboxSession<'_> {
        SandboxSession::new(&mut *self.executor, id)
    }

    /// Look up a resource that must be unique
    fn find(&mut self, filter: ListFilter) -> Result<Option<String>, PlzError> {
        let mut ids = self.executor.list(&filter)?;
        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.pop()),
            _ => Err(AmbiguousError::MultipleMatches {
                kind: filter.kind.to_string(),
                name: filter.name,
                ids,
            }
            .into()),
        }
    }

    /// Copy the identity marker out of a sandbox (running or not) and parse it
    fn read_marker(&mut self, id: &str) -> Result<ImageMarker, IncompatibleError> {
        let unreadable = |reason: String| IncompatibleError::MarkerUnreadable {
            sandbox: id.to_string(),
            reason,
        };

        std::fs::create_dir_all(&self.build_dir).map_err(|e| unreadable(e.to_string()))?;
        let scratch =
            tempfile::NamedTempFile::new_in(&self.build_dir).map_err(|e| unreadable(e.to_string()))?;

        self.executor
            .copy_out(id, IMAGE_MARKER_PATH, scratch.path())
            .map_err(|e| unreadable(e.to_string()))?;
        let content =
            std::fs::read_to_string(scratch.path()).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))
    }

    /// Compare a marker against this plz and the requested python
    fn check_marker(&self, marker: &ImageMarker) -> Result<(), IncompatibleError> {
        if marker.version != IMAGE_MARKER_VERSION {
            return Err(IncompatibleError::ImageVersion {
                expected: IMAGE_MARKER_VERSION.to_string(),
                found: marker.version.clone(),
            });
        }
        if marker.python != self.python {
            return Err(IncompatibleError::RuntimeVersion {
                expected: self.python.clone(),
                found: marker.python.clone(),
            });
        }
        Ok(())
    }

    fn verify_image(&mut self, id: &str) -> Result<(), IncompatibleError> {
        let marker = self.read_marker(id)?;
        self.check_marker(&marker)
    }

    /// Decide whether the existing sandbox can be reused without touching it
    pub fn validate(&mut self, state: &BuildState) -> Result<SandboxStatus, PlzError> {
        let Some(id) = self.find(ListFilter::container(&self.name))? else {
            return Ok(SandboxStatus::Absent);
        };

        let info = self.executor.inspect(&id)?;
        let stale = |reason: &str| SandboxStatus::Stale {
            id: id.clone(),
            running: info.running,
            reason: reason.to_string(),
        };

        let Some(record) = &state.sandbox else {
            return Ok(stale("no build state recorded for it"));
        };
        if record.id != info.id {
            return Ok(stale("mismatched container id"));
        }
        if record.created_at != info.created_at {
            return Ok(stale("mismatched creation date"));
        }
        if record.base_version != IMAGE_MARKER_VERSION || record.runtime_version != self.python {
            return Ok(stale("incompatible recorded versions"));
        }
        if let Err(e) = self.verify_image(&id) {
            return Ok(stale(&e.to_string()));
        }

        Ok(SandboxStatus::Reusable {
            id,
            running: info.running,
        })
    }

    /// Return a sandbox whose recorded identity matches `state`.
    ///
    /// `rebuild` discards the existing sandbox and its base image.
    pub fn acquire(&mut self, state: &mut BuildState, rebuild: bool) -> Result<Acquisition, PlzError> {
        let status = self.validate(state)?;

        match status {
            SandboxStatus::Reusable { id, running } if !rebuild => {
                tracing::info!("Reusing container {} ({})", self.name, id);
                Ok(Acquisition {
                    id,
                    fresh: false,
                    running,
                })
            }
            SandboxStatus::Reusable { id, running } => {
                tracing::info!("Rebuild requested, discarding container {}", self.name);
                self.destroy(&id, running)?;
                self.create_fresh(state, rebuild)
            }
            SandboxStatus::Stale { id, running, reason } => {
                tracing::info!("Rebuilding container {}: {}", self.name, reason);
                self.destroy(&id, running)?;
                self.create_fresh(state, rebuild)
            }
            SandboxStatus::Absent => self.create_fresh(state, rebuild),
        }
    }

    /// Start the sandbox if it is not already running
    pub fn ensure_running(&mut self, acquisition: &mut Acquisition) -> Result<(), PlzError> {
        if acquisition.running {
            return Ok(());
        }
        tracing::info!("Starting container: {}", self.name);
        self.executor.start(&acquisition.id)?;
        self.started = Some(acquisition.id.clone());
        acquisition.running = true;
        Ok(())
    }

    /// Stop the sandbox if this manager started it
    pub fn release(&mut self) -> Result<(), PlzError> {
        if let Some(id) = self.started.take() {
            tracing::info!("Stop container: {}", id);
            self.executor.stop(&id)?;
        }
        Ok(())
    }

    /// Stop and remove a sandbox
    fn destroy(&mut self, id: &str, running: bool) -> Result<(), PlzError> {
        if running {
            self.executor.stop(id)?;
        }
        self.executor.remove(ResourceKind::Container, id)?;
        if self.started.as_deref() == Some(id) {
            self.started = None;
        }
        Ok(())
    }

    /// Remove the named sandbox (and optionally its base image). Returns what was removed.
    pub fn clean(&mut self, remove_image: bool) -> Result<Vec<String>, PlzError> {
        let mut removed = Vec::new();
        if let Some(id) = self.find(ListFilter::container(&self.name))? {
            let info = self.executor.inspect(&id)?;
            self.destroy(&id, info.running)?;
            removed.push(id);
        }
        if remove_image {
            if let Some(id) = self.find(ListFilter::image(self.image_name()))? {
                self.executor.remove(ResourceKind::Image, &id)?;
                removed.push(id);
            }
        }
        Ok(removed)
    }

    /// Make sure the base image exists, building it when missing
    fn ensure_image(&mut self, rebuild: bool) -> Result<String, PlzError> {
        let image = self.image_name();
        let mut existing = self.find(ListFilter::image(&image))?;

        if rebuild {
            if let Some(id) = existing.take() {
                tracing::info!("Removing image {} ({})", image, id);
                self.executor.remove(ResourceKind::Image, &id)?;
            }
        }

        if existing.is_none() {
            tracing::info!("Building Docker Image: {}", image);
            let spec = ImageSpec {
                dockerfile: base_dockerfile(&self.python),
            };
            let id = self.executor.build_image(&image, &spec)?;
            tracing::info!("Built image {} ({})", image, id);
        }
        Ok(image)
    }

    /// Create, start, bootstrap and baseline a new sandbox
    fn create_fresh(&mut self, state: &mut BuildState, rebuild: bool) -> Result<Acquisition, PlzError> {
        state.invalidate_from(Tier::Base);

        let image = self.ensure_image(rebuild)?;
        let binds = [MountConfig::read_write(
            self.build_dir.clone(),
            PathBuf::from(INSTALL_PATH),
        )];

        tracing::info!("Creating Container: {}", self.name);
        let id = self.executor.create(&image, &self.name, &binds)?;
        tracing::info!("Container creation successful: {}", id);

        // check the image before doing anything else
        if let Err(e) = self.verify_image(&id) {
            tracing::error!(
                "Image {} is not usable (container {}). Re-run with --rebuild to rebuild it",
                image,
                id
            );
            return Err(e.into());
        }

        self.executor.start(&id)?;
        self.started = Some(id.clone());
        let info = self.executor.inspect(&id)?;

        let python = self.python.clone();
        let mut session = self.session(&id);
        if needs_epel(&python) {
            // the epel install fails unless yum runs under python2
            session.run(&["env", "PYTHON=python2", "amazon-linux-extras", "install", "epel"])?;
        }
        for package in BOOTSTRAP_PACKAGES {
            session.run(&["yum", "install", "-y", *package])?;
        }
        let baseline = diff::list_installed(&mut session)?;
        tracing::info!("Recorded {} base packages for {}", baseline.len(), id);

        state.sandbox = Some(SandboxIdentity {
            id: info.id,
            created_at: info.created_at,
            base_version: IMAGE_MARKER_VERSION.to_string(),
            runtime_version: python,
        });
        state.base_packages = baseline;
        state.complete(Tier::Base);

        Ok(Acquisition {
            id,
            fresh: true,
            running: true,
        })
    }
}
