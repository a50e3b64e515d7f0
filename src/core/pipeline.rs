//! Layered build pipeline
//!
//! Runs the build as a stack of cached tiers: the sandbox, the system packages
//! copied out of it, the python packages installed through it and the final
//! archive. Each tier is rebuilt only when one of its own inputs changed or a
//! tier below it was rebuilt.
//!
//! The [`BuildState`] is threaded through every stage and checkpointed after
//! each one. Before a dirty stage runs, its recorded entries (and those of the
//! tiers above it) are cleared, so an interrupted stage is always dirty on the
//! next run. When a stage fails, its state is reset, any artifact is removed
//! and the stage error is returned.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::defaults::{ARTIFACT_FILENAME, DEFAULT_PYTHON, STATE_FILENAME};
use crate::config::paths::{
    CONSTRAINTS_PATH, HOST_CONSTRAINTS_DIR, HOST_PYTHON_DIR, HOST_SYSTEM_DIR, PYTHON_INSTALL_PATH,
};
use crate::core::archive::{self, ArchiveOptions};
use crate::core::diff::{self, DiffRequest};
use crate::core::fingerprint::{self, FileSetFingerprint};
use crate::core::inventory::{BaselineInventory, InstalledInventory, PackageVersions};
use crate::core::lifecycle::{check_runtime, SandboxManager};
use crate::core::requirements::{read_requirements, Requirement, SystemRequirements};
use crate::core::specifier::satisfies;
use crate::core::stages::{DirtyReason, StageGraph, Tier};
use crate::core::state::BuildState;
use crate::error::{FilesystemError, IntegrityError, PlzError};
use crate::infra::executor::{SandboxExecutor, SandboxSession};
use crate::infra::filesystem;

/// Everything a build needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Directory holding the state, stage outputs and (by default) the artifact
    pub build_dir: PathBuf,
    /// Caller files and directories to bundle
    pub files: Vec<PathBuf>,
    /// pip requirements files
    pub requirements: Vec<PathBuf>,
    /// pip constraints files
    pub constraints: Vec<PathBuf>,
    /// System requirements document
    pub system_requirements: Option<PathBuf>,
    /// Extra arguments for every pip install
    pub pip_args: Vec<String>,
    /// Extra names to leave out of the archive
    pub ignore: Vec<String>,
    /// Extra suffixes to leave out of the archive
    pub ignore_filetypes: Vec<String>,
    /// Where to write the artifact
    pub artifact: Option<PathBuf>,
    /// Directory to store bundled files under
    pub prefix: Option<String>,
    /// Sandbox name, also the base of the image name
    pub sandbox_name: String,
    /// Python version to build for
    pub python_version: String,
    /// Write the installed python packages here
    pub freeze: Option<PathBuf>,
    /// Recreate the sandbox and its image
    pub rebuild: bool,
    /// Re-run the system package stage
    pub reinstall_system: bool,
    /// Re-run the python package stage
    pub reinstall_python: bool,
    /// Rewrite the archive even if it is up to date
    pub force: bool,
}

impl BuildConfig {
    /// A build in `build_dir` using the sandbox `sandbox_name`
    pub fn new(build_dir: impl Into<PathBuf>, sandbox_name: impl Into<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
            files: Vec::new(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            system_requirements: None,
            pip_args: Vec::new(),
            ignore: Vec::new(),
            ignore_filetypes: Vec::new(),
            artifact: None,
            prefix: None,
            sandbox_name: sandbox_name.into(),
            python_version: DEFAULT_PYTHON.to_string(),
            freeze: None,
            rebuild: false,
            reinstall_system: false,
            reinstall_python: false,
            force: false,
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<PathBuf>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<PathBuf>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_system_requirements(mut self, path: Option<PathBuf>) -> Self {
        self.system_requirements = path;
        self
    }

    pub fn with_pip_args(mut self, args: Vec<String>) -> Self {
        self.pip_args = args;
        self
    }

    pub fn with_ignore(mut self, names: Vec<String>, suffixes: Vec<String>) -> Self {
        self.ignore = names;
        self.ignore_filetypes = suffixes;
        self
    }

    pub fn with_artifact(mut self, artifact: Option<PathBuf>) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_python_version(mut self, version: impl Into<String>) -> Self {
        self.python_version = version.into();
        self
    }

    pub fn with_freeze(mut self, freeze: Option<PathBuf>) -> Self {
        self.freeze = freeze;
        self
    }

    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn with_reinstall(mut self, system: bool, python: bool) -> Self {
        self.reinstall_system = system;
        self.reinstall_python = python;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Path of the persisted build state
    pub fn state_path(&self) -> PathBuf {
        self.build_dir.join(STATE_FILENAME)
    }

    /// Path the artifact is written to
    pub fn artifact_path(&self) -> PathBuf {
        self.artifact
            .clone()
            .unwrap_or_else(|| self.build_dir.join(ARTIFACT_FILENAME))
    }

    /// Host directory system package files are copied into
    pub fn system_dir(&self) -> PathBuf {
        self.build_dir.join(HOST_SYSTEM_DIR)
    }

    /// Host directory python packages are installed into
    pub fn python_dir(&self) -> PathBuf {
        self.build_dir.join(HOST_PYTHON_DIR)
    }

    fn constraints_dir(&self) -> PathBuf {
        self.build_dir.join(HOST_CONSTRAINTS_DIR)
    }
}

/// What a successful build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// The artifact
    pub artifact: PathBuf,
    /// SHA256 of the artifact
    pub artifact_hash: String,
    /// Id of the sandbox the build used
    pub sandbox: String,
    /// Stages that ran, in order
    pub rebuilt: Vec<Tier>,
}

/// Fingerprints and parsed documents for this invocation
struct Inputs {
    files: FileSetFingerprint,
    requirements: FileSetFingerprint,
    constraints: FileSetFingerprint,
    system_requirements: FileSetFingerprint,
    system: Option<SystemRequirements>,
    python: Vec<Requirement>,
}

impl Inputs {
    fn gather(config: &BuildConfig) -> Result<Self, PlzError> {
        let system_paths: Vec<&PathBuf> = config.system_requirements.iter().collect();
        let system = config
            .system_requirements
            .as_deref()
            .map(SystemRequirements::load)
            .transpose()?;

        Ok(Self {
            files: FileSetFingerprint::compute(&config.files)?,
            requirements: FileSetFingerprint::compute(&config.requirements)?,
            constraints: FileSetFingerprint::compute(&config.constraints)?,
            system_requirements: FileSetFingerprint::compute(&system_paths)?,
            system,
            python: read_requirements(&config.requirements)?,
        })
    }
}

fn checkpoint(state: &BuildState, config: &BuildConfig) -> Result<(), PlzError> {
    state.save(&config.state_path())?;
    Ok(())
}

fn has_content(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

/// Build the artifact described by `config`, reusing whatever is still valid
pub fn build(
    executor: &mut dyn SandboxExecutor,
    config: &BuildConfig,
) -> Result<BuildReport, PlzError> {
    check_runtime(&config.python_version)?;
    filesystem::create_dir_all(&config.build_dir)?;

    let inputs = Inputs::gather(config)?;
    let state_path = config.state_path();
    let mut state = BuildState::load(&state_path);

    let mut manager = SandboxManager::new(
        executor,
        &config.sandbox_name,
        &config.python_version,
        &config.build_dir,
    );
    let mut progress = Tier::Base;
    let result = run_stages(&mut manager, config, &inputs, &mut state, &mut progress);
    let released = manager.release();

    match result {
        Ok(report) => {
            state.save(&state_path)?;
            released?;
            tracing::info!("Built {}", report.artifact.display());
            Ok(report)
        }
        Err(e) => {
            tracing::error!("Build failed during the {} stage: {}", progress, e);
            state.invalidate_from(progress);

            // never leave an artifact that looks like a successful build
            if let Err(remove) = filesystem::remove_file(&config.artifact_path()) {
                tracing::error!("{}", remove);
            }
            if let Err(save) = state.save(&state_path) {
                tracing::error!("{}", save);
            }
            if let Err(stop) = released {
                tracing::warn!("{}", stop);
            }
            Err(e)
        }
    }
}

fn run_stages(
    manager: &mut SandboxManager<'_>,
    config: &BuildConfig,
    inputs: &Inputs,
    state: &mut BuildState,
    progress: &mut Tier,
) -> Result<BuildReport, PlzError> {
    let mut acquisition = manager.acquire(state, config.rebuild)?;
    let mut graph = StageGraph::new();

    if acquisition.fresh {
        graph.mark(Tier::Base, DirtyReason::SandboxRecreated);
        // outputs copied from a previous sandbox are meaningless now
        filesystem::reset_dir(&config.system_dir())?;
        filesystem::reset_dir(&config.python_dir())?;
        checkpoint(state, config)?;
    }

    let artifact = config.artifact_path();
    let on_disk = fingerprint::artifact_fingerprint(&artifact)?;

    graph.mark_if(config.reinstall_system, Tier::System, DirtyReason::Forced);
    graph.mark_if(
        state.system_requirements != inputs.system_requirements,
        Tier::System,
        DirtyReason::InputsChanged("system requirements"),
    );
    graph.mark_if(config.reinstall_python, Tier::Python, DirtyReason::Forced);
    graph.mark_if(
        state.requirements != inputs.requirements,
        Tier::Python,
        DirtyReason::InputsChanged("requirements"),
    );
    graph.mark_if(
        state.constraints != inputs.constraints,
        Tier::Python,
        DirtyReason::InputsChanged("constraints"),
    );
    graph.mark_if(config.force, Tier::Bundle, DirtyReason::Forced);
    graph.mark_if(
        state.files != inputs.files,
        Tier::Bundle,
        DirtyReason::InputsChanged("files"),
    );
    graph.mark_if(state.prefix != config.prefix, Tier::Bundle, DirtyReason::PrefixChanged);
    graph.mark_if(
        on_disk.is_none() || on_disk != state.artifact_hash,
        Tier::Bundle,
        DirtyReason::ArtifactMismatch,
    );
    for tier in [Tier::System, Tier::Python, Tier::Bundle] {
        graph.mark_if(!state.is_complete(tier), tier, DirtyReason::Incomplete);
    }

    let mut rebuilt = Vec::new();

    if graph.is_dirty(Tier::System) || graph.is_dirty(Tier::Python) {
        manager.ensure_running(&mut acquisition)?;
    }

    if graph.is_dirty(Tier::System) {
        *progress = Tier::System;
        tracing::info!("Rebuilding system packages: {}", graph.explain(Tier::System));

        let previous = std::mem::take(&mut state.system_packages);
        let baseline = state.base_packages.clone();
        state.invalidate_from(Tier::System);
        checkpoint(state, config)?;

        let mut session = manager.session(&acquisition.id);
        state.system_packages = system_stage(
            &mut session,
            config,
            inputs.system.as_ref(),
            baseline,
            previous,
        )?;
        state.system_requirements = inputs.system_requirements.clone();
        state.complete(Tier::System);
        checkpoint(state, config)?;
        rebuilt.push(Tier::System);
    }

    if graph.is_dirty(Tier::Python) {
        *progress = Tier::Python;
        tracing::info!("Rebuilding python packages: {}", graph.explain(Tier::Python));

        let mut previous = std::mem::take(&mut state.python_packages);
        if state.constraints != inputs.constraints {
            // recorded versions were resolved under other constraints
            tracing::info!("Constraints changed, reinstalling every requirement");
            previous = PackageVersions::new();
        }
        state.invalidate_from(Tier::Python);
        checkpoint(state, config)?;

        let mut session = manager.session(&acquisition.id);
        state.python_packages = python_stage(&mut session, config, &inputs.python, previous)?;
        state.requirements = inputs.requirements.clone();
        state.constraints = inputs.constraints.clone();
        state.complete(Tier::Python);
        checkpoint(state, config)?;
        rebuilt.push(Tier::Python);
    }

    if graph.is_dirty(Tier::Bundle) {
        *progress = Tier::Bundle;
        tracing::info!("Rebuilding package: {}", graph.explain(Tier::Bundle));

        state.invalidate_from(Tier::Bundle);
        checkpoint(state, config)?;

        let hash = bundle_stage(config, &artifact)?;
        state.files = inputs.files.clone();
        state.prefix = config.prefix.clone();
        state.artifact_hash = Some(hash);
        state.complete(Tier::Bundle);
        checkpoint(state, config)?;
        rebuilt.push(Tier::Bundle);
    } else {
        tracing::info!("Package {} is up to date", artifact.display());
    }

    if let Some(freeze) = &config.freeze {
        if rebuilt.contains(&Tier::Python) || !freeze.exists() {
            write_freeze(freeze, &state.python_packages)?;
        }
    }

    Ok(BuildReport {
        artifact,
        artifact_hash: state.artifact_hash.clone().unwrap_or_default(),
        sandbox: acquisition.id,
        rebuilt,
    })
}

/// Install the requested system packages and copy what changed
fn system_stage(
    session: &mut SandboxSession<'_>,
    config: &BuildConfig,
    document: Option<&SystemRequirements>,
    baseline: BaselineInventory,
    previous: InstalledInventory,
) -> Result<InstalledInventory, PlzError> {
    let system_dir = config.system_dir();

    let Some(document) = document else {
        tracing::debug!("No system requirements, clearing {}", system_dir.display());
        filesystem::reset_dir(&system_dir)?;
        return Ok(InstalledInventory::new());
    };

    if previous.is_empty() && has_content(&system_dir) {
        // files without an inventory cannot be removed selectively
        tracing::info!("Clearing untracked system files in {}", system_dir.display());
        filesystem::reset_dir(&system_dir)?;
    } else {
        filesystem::create_dir_all(&system_dir)?;
    }

    let skip = document.skip_set();
    let requested: BTreeSet<String> = document
        .names()
        .into_iter()
        .filter(|name| !skip.contains(name))
        .collect();

    for name in &requested {
        tracing::info!("Yum install {}", name);
        session.run(&["yum", "install", "-y", name])?;
    }

    let request = DiffRequest {
        baseline,
        explicit_files: document.explicit_files(),
        filetypes: document.filetype_set(),
        include: document.include_set(),
        skip,
        requested,
    };
    let outcome = diff::apply(session, previous, &request)?;
    tracing::info!(
        "Tracking {} system packages ({} files copied)",
        outcome.inventory.len(),
        outcome.copied.len()
    );
    Ok(outcome.inventory)
}

/// Copy constraint files into the bind mount, returning pip arguments for them
fn stage_constraints(config: &BuildConfig) -> Result<Vec<String>, PlzError> {
    let dir = config.constraints_dir();
    filesystem::reset_dir(&dir)?;

    let mut args = Vec::new();
    for (index, path) in config.constraints.iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "constraints.txt".to_string());
        let staged = format!("{index}-{file_name}");
        filesystem::copy_file(path, &dir.join(&staged))?;
        args.push("-c".to_string());
        args.push(format!("{CONSTRAINTS_PATH}/{staged}"));
    }
    Ok(args)
}

/// Install requirements not already satisfied by `previous`
fn python_stage(
    session: &mut SandboxSession<'_>,
    config: &BuildConfig,
    requirements: &[Requirement],
    mut previous: PackageVersions,
) -> Result<PackageVersions, PlzError> {
    let python_dir = config.python_dir();
    let constraint_args = stage_constraints(config)?;

    let required: BTreeSet<String> = requirements
        .iter()
        .flat_map(|r| [r.key(), r.install_arg().to_string()])
        .collect();
    let dropped = previous.iter().any(|(name, _)| !required.contains(name));
    if dropped || (previous.is_empty() && has_content(&python_dir)) {
        // pip cannot uninstall from a target directory, start over
        tracing::info!("Clearing python packages in {}", python_dir.display());
        filesystem::reset_dir(&python_dir)?;
        previous = PackageVersions::new();
    } else {
        filesystem::create_dir_all(&python_dir)?;
    }

    let env = [("PYTHONPATH".to_string(), PYTHON_INSTALL_PATH.to_string())];
    let mut installed = PackageVersions::new();

    for requirement in requirements {
        let key = requirement.key();

        if let Requirement::Plain { specifier, .. } = requirement {
            if let Some(version) = previous.get(&key) {
                if satisfies(version, specifier) {
                    tracing::info!("{} {} already satisfies {:?}", key, version, specifier);
                    installed.insert(key, version);
                    continue;
                }
            }
        }

        let mut argv = vec!["pip", "install", "--target", PYTHON_INSTALL_PATH, "--upgrade"];
        argv.extend(config.pip_args.iter().map(String::as_str));
        argv.extend(constraint_args.iter().map(String::as_str));
        argv.push(requirement.install_arg());
        session.run_with_env(&argv, &env)?;

        match (installed_version(session, requirement, &env)?, requirement) {
            (Some(version), _) => {
                tracing::info!("Installed {} {}", key, version);
                installed.insert(key, version);
            }
            (None, Requirement::Vcs { line, .. }) => {
                // the guessed name was wrong, pip still installed something
                tracing::warn!("Unable to work out which project {} installed", line);
                installed.insert(line.clone(), "*");
            }
            (None, _) => {
                tracing::error!("Unable to work out installed version for {}", key);
                return Err(IntegrityError::NoVersion {
                    requirement: requirement.install_arg().to_string(),
                }
                .into());
            }
        }
    }

    Ok(installed)
}

/// Work out the version pip just installed, `None` when nothing answers.
///
/// The module's own `__version__` is asked first because package metadata is
/// unreliable after a downgrade.
fn installed_version(
    session: &mut SandboxSession<'_>,
    requirement: &Requirement,
    env: &[(String, String)],
) -> Result<Option<String>, PlzError> {
    let Some(name) = requirement.project_name() else {
        return Ok(Some("*".to_string()));
    };

    let module = name.replace(|c: char| c == '-' || c == '.', "_");
    let code = format!("import {module};print({module}.__version__)");
    let output = session.probe_with_env(&["python", "-c", &code], env)?;
    let version = output.stdout.trim();
    if output.success() && !version.is_empty() {
        return Ok(Some(version.to_string()));
    }

    let output = session.probe_with_env(&["pip", "show", name], env)?;
    if output.success() {
        if let Some(version) = output
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("Version: "))
        {
            return Ok(Some(version.trim().to_string()));
        }
    }

    Ok(None)
}

/// Assemble the archive and return its fingerprint
fn bundle_stage(config: &BuildConfig, artifact: &Path) -> Result<String, PlzError> {
    filesystem::remove_file(artifact)?;

    let mut roots = config.files.clone();
    for dir in [config.system_dir(), config.python_dir()] {
        if !dir.is_dir() {
            continue;
        }
        let mut children: Vec<PathBuf> = std::fs::read_dir(&dir)
            .and_then(|entries| entries.map(|e| e.map(|e| e.path())).collect())
            .map_err(|e| FilesystemError::ReadFile {
                path: dir.clone(),
                error: e.to_string(),
            })?;
        children.sort();
        roots.extend(children);
    }

    let options = ArchiveOptions::default()
        .with_prefix(config.prefix.clone())
        .with_ignore(config.ignore.iter().cloned())
        .with_ignore_filetypes(config.ignore_filetypes.iter().cloned());
    archive::write_archive(artifact, &roots, &options)?;

    fingerprint::artifact_fingerprint(artifact)?.ok_or_else(|| {
        IntegrityError::FingerprintMismatch {
            path: artifact.to_path_buf(),
            expected: "written archive".to_string(),
            actual: "missing".to_string(),
        }
        .into()
    })
}

/// Write `name==version` lines for the tracked python packages
fn write_freeze(path: &Path, packages: &PackageVersions) -> Result<(), PlzError> {
    let content: String = packages
        .iter()
        .filter(|(_, version)| version.as_str() != "*")
        .map(|(name, version)| format!("{name}=={version}\n"))
        .collect();
    filesystem::write_file_atomic(path, content.as_bytes())?;
    tracing::info!("Froze python packages to {}", path.display());
    Ok(())
}
