//! Remembers the last profile and behavior across restarts

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

const LAST_PROFILE: &str = "last_profile";
const LAST_EXPERIMENT: &str = "last_experiment";

/// Paths of the last successfully set up profile and behavior
///
/// Each is stored as a one-line file under the persistence directory. Without
/// a directory nothing is remembered.
#[derive(Debug, Clone, Default)]
pub struct Persistence {
    directory: Option<PathBuf>,
}

impl Persistence {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory }
    }

    pub fn last_profile(&self) -> Option<PathBuf> {
        self.read(LAST_PROFILE)
    }

    pub fn last_experiment(&self) -> Option<PathBuf> {
        self.read(LAST_EXPERIMENT)
    }

    pub fn remember_profile(&self, path: &Path) -> Result<()> {
        self.write(LAST_PROFILE, path)
    }

    pub fn remember_experiment(&self, path: &Path) -> Result<()> {
        self.write(LAST_EXPERIMENT, path)
    }

    fn read(&self, name: &str) -> Option<PathBuf> {
        let file = self.directory.as_ref()?.join(name);
        let content = fs::read_to_string(&file).ok()?;
        let path = PathBuf::from(content.trim());
        if path.as_os_str().is_empty() || !path.exists() {
            log::debug!("Ignoring stale {} entry {:?}", name, path);
            return None;
        }
        Some(path)
    }

    fn write(&self, name: &str, path: &Path) -> Result<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        fs::create_dir_all(directory)?;
        let path = fs::canonicalize(path)?;
        fs::write(directory.join(name), format!("{}\n", path.display()))?;
        log::debug!("Remembered {} = {:?}", name, path);
        Ok(())
    }
}
