//! `plz state`: print what the last build recorded

use std::path::Path;

use anyhow::{Context, Result};

use super::{load_manifest, Target};
use crate::config::defaults::STATE_FILENAME;
use crate::core::state::BuildState;

/// Execute the state command
pub fn execute(project_dir: &Path, manifest: Option<&Path>, target: &Target) -> Result<()> {
    let mut manifest = load_manifest(project_dir, manifest)?;
    target.apply(&mut manifest);

    let path = project_dir.join(&manifest.package.build).join(STATE_FILENAME);
    if !path.exists() {
        tracing::warn!("No build state at {}, nothing has been built", path.display());
    }

    let state = BuildState::load(&path);
    let json = state.to_json().context("Failed to serialize build state")?;
    println!("{json}");
    Ok(())
}
