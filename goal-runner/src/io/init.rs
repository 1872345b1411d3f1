//! Layout of the data directory shared by the orchestrator and producers.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RunnerConfig, load_config, write_config};

/// Default data directory name, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".goal-runner";

/// All canonical paths within a data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    /// Touched by producers to wake the orchestrator early.
    pub wake_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.toml"),
            db_path: root.join("goals.sqlite"),
            wake_path: root.join("wake"),
            gitignore_path: root.join(".gitignore"),
            root,
        }
    }

    /// Resolve the `write_to_file` directory from config.
    pub fn output_dir(&self, config: &RunnerConfig) -> PathBuf {
        if config.dispatch.output_dir.is_absolute() {
            config.dispatch.output_dir.clone()
        } else {
            self.root.join(&config.dispatch.output_dir)
        }
    }

    pub fn load_config(&self) -> Result<RunnerConfig> {
        load_config(&self.config_path)
    }
}

/// Options for `init_data_dir`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite an existing config with defaults.
    pub force: bool,
}

const DATA_GITIGNORE: &str = "goals.sqlite*\nwake\noutput/\n";

/// Create the data directory with a default config.
///
/// Fails if the config already exists unless `options.force` is set. The
/// database is created lazily by the first store operation.
pub fn init_data_dir(root: &Path, options: &InitOptions) -> Result<DataPaths> {
    let paths = DataPaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.root.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    fs::create_dir_all(&paths.root)
        .with_context(|| format!("create directory {}", paths.root.display()))?;
    write_config(&paths.config_path, &RunnerConfig::default())?;
    fs::write(&paths.gitignore_path, DATA_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    Ok(paths)
}
