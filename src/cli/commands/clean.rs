//! CLI implementation for `plz clean`
//!
//! Removes the build directory, then the named sandbox when a container
//! runtime is available.

use std::path::Path;

use anyhow::{Context, Result};

use super::{load_manifest, Target};
use crate::cli::output::status;
use crate::core::lifecycle::SandboxManager;
use crate::infra::docker::DockerExecutor;
use crate::infra::filesystem;

/// Execute the clean command
pub fn execute(
    project_dir: &Path,
    manifest: Option<&Path>,
    target: &Target,
    remove_image: bool,
) -> Result<()> {
    let mut manifest = load_manifest(project_dir, manifest)?;
    target.apply(&mut manifest);
    let build_dir = project_dir.join(&manifest.package.build);

    if build_dir.exists() {
        filesystem::remove_dir_all(&build_dir)
            .with_context(|| "Failed to clean build directory")?;
        println!("{} Removed {}", status::SUCCESS, build_dir.display());
    } else {
        println!("{} Nothing to clean in {}", status::SUCCESS, build_dir.display());
    }

    let Ok(mut executor) = DockerExecutor::detect() else {
        println!(
            "{} No container runtime found, leaving sandboxes alone",
            status::WARNING
        );
        return Ok(());
    };

    let mut manager = SandboxManager::new(
        &mut executor,
        &manifest.package.name,
        &manifest.package.python,
        &build_dir,
    );
    let removed = manager
        .clean(remove_image)
        .with_context(|| format!("Failed to remove sandbox {}", manifest.package.name))?;
    for id in removed {
        println!("{} Removed {}", status::SUCCESS, id);
    }
    Ok(())
}
