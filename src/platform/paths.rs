use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Per-user locations used when no explicit config path is given.
pub struct RouterPaths {
    project_dirs: ProjectDirs,
}

impl RouterPaths {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("ai", "ai-router", "ai-router")
            .ok_or_else(|| Error::configuration("Failed to determine configuration directory"))?;

        Ok(Self { project_dirs })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.project_dirs.config_dir().to_path_buf()
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("router.toml")
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        Ok(())
    }
}
