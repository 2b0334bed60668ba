//! Initialization helpers for `.beamforge/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};

/// Engine directory name at the project root. Never part of the project's files.
pub const FORGE_DIR_NAME: &str = ".beamforge";

/// All canonical paths within `.beamforge/` for a project root.
#[derive(Debug, Clone)]
pub struct ForgePaths {
    pub root: PathBuf,
    pub forge_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

impl ForgePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let forge_dir = root.join(FORGE_DIR_NAME);
        let state_dir = forge_dir.join("state");
        Self {
            root: root.clone(),
            forge_dir: forge_dir.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: forge_dir.join(".gitignore"),
            config_path: forge_dir.join("config.toml"),
            checkpoint_path: state_dir.join("checkpoint.json"),
        }
    }
}

/// Options for `init_forge`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.beamforge/` with a default config in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_forge(root: &Path, options: &InitOptions) -> Result<ForgePaths> {
    let paths = ForgePaths::new(root);
    if paths.forge_dir.exists() && !paths.forge_dir.is_dir() {
        return Err(anyhow!("init: .beamforge exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, FORGE_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    Ok(paths)
}

const FORGE_GITIGNORE: &str = "state/\n";
