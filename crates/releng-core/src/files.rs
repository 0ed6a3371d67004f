//! Filesystem helpers that honour noop mode.

use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

/// Filesystem operations used by action handlers.
///
/// In noop mode every call logs what it would have done and returns `Ok`.
#[derive(Debug, Clone, Default)]
pub struct FileOps {
    noop: bool,
}

impl FileOps {
    pub fn new(noop: bool) -> Self {
        Self { noop }
    }

    /// Create a directory and its parents. An existing directory is fine.
    pub fn mkdir_p(&self, path: &Path) -> Result<()> {
        if self.noop {
            debug!(path = %path.display(), "noop: would create directory");
            return Ok(());
        }
        if !path.is_dir() {
            info!(path = %path.display(), "Creating directory");
            std::fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Remove a file or directory tree. A missing path is fine.
    pub fn rmtree(&self, path: &Path) -> Result<()> {
        if self.noop {
            debug!(path = %path.display(), "noop: would remove path");
            return Ok(());
        }
        match std::fs::symlink_metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Nothing to remove");
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(meta) => {
                info!(path = %path.display(), "Removing");
                if meta.is_dir() {
                    std::fs::remove_dir_all(path)?;
                } else {
                    std::fs::remove_file(path)?;
                }
                Ok(())
            }
        }
    }

    pub fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if self.noop {
            debug!(from = %from.display(), to = %to.display(), "noop: would copy file");
            return Ok(());
        }
        info!(from = %from.display(), to = %to.display(), "Copying file");
        std::fs::copy(from, to)?;
        Ok(())
    }
}
