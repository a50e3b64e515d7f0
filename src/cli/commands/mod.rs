//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod build;
pub mod clean;
pub mod state;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::config::defaults::MANIFEST_FILENAME;
use crate::core::manifest::Manifest;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the package, reusing every stage that is still valid
    Build(build::BuildArgs),

    /// Print the recorded build state as JSON
    State {
        #[command(flatten)]
        target: Target,
    },

    /// Delete the build directory and remove the sandbox
    Clean {
        #[command(flatten)]
        target: Target,

        /// Also remove the sandbox base image
        #[arg(long)]
        image: bool,
    },
}

/// Options locating a build
#[derive(Args, Debug, Clone, Default)]
pub struct Target {
    /// Build directory
    #[arg(long)]
    pub build: Option<PathBuf>,

    /// Sandbox name
    #[arg(long, env = "PLZ_SANDBOX")]
    pub name: Option<String>,

    /// Python version to build for
    #[arg(long)]
    pub python: Option<String>,
}

impl Target {
    /// Override manifest values with the ones given on the command line
    pub fn apply(&self, manifest: &mut Manifest) {
        if let Some(build) = &self.build {
            manifest.package.build.clone_from(build);
        }
        if let Some(name) = &self.name {
            manifest.package.name.clone_from(name);
        }
        if let Some(python) = &self.python {
            manifest.package.python.clone_from(python);
        }
    }
}

/// Load the manifest at `explicit`, else `plz.toml` in `project_dir` if present.
///
/// Without a manifest every setting comes from the command line and defaults.
pub fn load_manifest(project_dir: &Path, explicit: Option<&Path>) -> Result<Manifest> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = project_dir.join(MANIFEST_FILENAME);
            if !default.exists() {
                tracing::debug!("No {} in {}", MANIFEST_FILENAME, project_dir.display());
                return Ok(Manifest::default());
            }
            default
        }
    };

    Manifest::load(&path).with_context(|| format!("Failed to load manifest {}", path.display()))
}

impl Commands {
    /// Execute the command
    pub fn run(self, manifest: Option<&Path>, quiet: bool) -> Result<()> {
        let current_dir = std::env::current_dir()?;
        match self {
            Self::Build(args) => build::execute(&current_dir, manifest, &args, quiet),
            Self::State { target } => state::execute(&current_dir, manifest, &target),
            Self::Clean { target, image } => {
                clean::execute(&current_dir, manifest, &target, image)
            }
        }
    }
}
