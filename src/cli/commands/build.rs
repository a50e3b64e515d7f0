//! Build command implementation
//!
//! Implements `plz build`: merges the manifest with command line flags and runs
//! the layered pipeline against the detected container runtime.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use super::{load_manifest, Target};
use crate::cli::output::{create_spinner, hidden_spinner, status};
use crate::core::fingerprint::absolute;
use crate::core::manifest::{frozen_path, Manifest};
use crate::core::pipeline::{self, BuildConfig};
use crate::infra::docker::DockerExecutor;

/// Arguments of `plz build`
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Files or directories to include in the package
    pub files: Vec<PathBuf>,

    /// Requirements file (repeatable)
    #[arg(short, long = "requirements")]
    pub requirements: Vec<PathBuf>,

    /// Constraints file (repeatable)
    #[arg(short, long = "constraints")]
    pub constraints: Vec<PathBuf>,

    /// System requirements document
    #[arg(long)]
    pub system: Option<PathBuf>,

    /// Where to write the package (defaults to package.zip in the build directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Path to prepend to all files in the package
    #[arg(long, alias = "zipped-prefix")]
    pub prefix: Option<String>,

    /// Extra argument for pip install (repeatable)
    #[arg(long = "pip-arg", allow_hyphen_values = true)]
    pub pip_args: Vec<String>,

    /// Write installed python versions next to the package
    #[arg(long)]
    pub freeze: bool,

    /// Recreate the sandbox and its base image
    #[arg(long)]
    pub rebuild: bool,

    /// Reinstall system packages
    #[arg(long)]
    pub reinstall_system: bool,

    /// Reinstall python packages
    #[arg(long)]
    pub reinstall_python: bool,

    /// Rewrite the package even if it is up to date
    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub target: Target,
}

fn absolute_all(cwd: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().map(|p| absolute(cwd, p)).collect()
}

/// Merge command line flags over the manifest.
///
/// Non-empty lists on the command line replace the manifest's lists.
pub fn build_config(cwd: &Path, mut manifest: Manifest, args: &BuildArgs) -> BuildConfig {
    args.target.apply(&mut manifest);
    manifest.package.build = absolute(cwd, &manifest.package.build);

    if !args.files.is_empty() {
        manifest.package.files = absolute_all(cwd, &args.files);
    }
    if !args.requirements.is_empty() {
        manifest.python.requirements = absolute_all(cwd, &args.requirements);
    }
    if !args.constraints.is_empty() {
        manifest.python.constraints = absolute_all(cwd, &args.constraints);
    }
    if !args.pip_args.is_empty() {
        manifest.python.pip_args.clone_from(&args.pip_args);
    }
    if let Some(system) = &args.system {
        manifest.system.requirements = Some(absolute(cwd, system));
    }
    if let Some(output) = &args.output {
        manifest.package.artifact = Some(absolute(cwd, output));
    }
    if args.prefix.is_some() {
        manifest.package.prefix.clone_from(&args.prefix);
    }

    let mut config = manifest
        .to_build_config()
        .with_rebuild(args.rebuild)
        .with_reinstall(args.reinstall_system, args.reinstall_python)
        .with_force(args.force);
    if args.freeze && config.freeze.is_none() {
        let freeze = frozen_path(&config.artifact_path());
        config = config.with_freeze(Some(freeze));
    }
    config
}

/// Execute the build command
pub fn execute(
    project_dir: &Path,
    manifest: Option<&Path>,
    args: &BuildArgs,
    quiet: bool,
) -> Result<()> {
    let manifest = load_manifest(project_dir, manifest)?;
    let config = build_config(project_dir, manifest, args);
    tracing::info!("Building package in {}", config.build_dir.display());

    let mut executor = DockerExecutor::detect().context("A container runtime is required to build")?;

    let spinner = if quiet {
        hidden_spinner()
    } else {
        create_spinner("Building package")
    };
    let result = pipeline::build(&mut executor, &config);
    spinner.finish_and_clear();

    let report = result.context("Build failed")?;
    if !quiet {
        if report.rebuilt.is_empty() {
            eprintln!("{} Package is up to date", status::SUCCESS);
        } else {
            let stages: Vec<String> = report.rebuilt.iter().map(ToString::to_string).collect();
            eprintln!("{} Rebuilt {}", status::SUCCESS, stages.join(", "));
        }
    }
    println!("{}", report.artifact.display());
    Ok(())
}
