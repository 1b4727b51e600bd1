//! Per-execution staging directories.
//!
//! A [`Workspace`] is a uniquely named directory that holds one execution's
//! source file, build descriptor and artifacts. It is removed recursively
//! when the handle is dropped, on every exit path. Removal failures are
//! logged and never propagated, so cleanup cannot mask the execution result.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// Failure to prepare a workspace.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workspace file name '{0}'")]
    InvalidName(String),
}

/// Exclusively owned staging directory, deleted on drop.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
}

impl Workspace {
    /// Create `<root>/<prefix><uuid>`. `root` defaults to the system temp dir.
    ///
    /// Uses `create_dir`, so an existing directory of the same name is an
    /// error rather than silently shared. A relative `root` is resolved
    /// against the current directory: the path is handed to `docker -v`,
    /// which treats relative sources as named volumes.
    pub fn create(root: Option<&Path>, prefix: &str) -> Result<Self, WorkspaceError> {
        let id = Uuid::new_v4();
        let base = root.map_or_else(std::env::temp_dir, Path::to_path_buf);
        let path = base.join(format!("{prefix}{}", id.simple()));
        let path = std::path::absolute(&path).map_err(|source| WorkspaceError::Create {
            path: path.clone(),
            source,
        })?;

        std::fs::create_dir(&path).map_err(|source| WorkspaceError::Create {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Created workspace");
        Ok(Self { id, path })
    }

    /// Unique identifier embedded in the directory name.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `contents` to a file directly inside the workspace.
    pub async fn write(&self, name: &str, contents: &str) -> Result<PathBuf, WorkspaceError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }

        let path = self.path.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| WorkspaceError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), bytes = contents.len(), "Staged file");
        Ok(path)
    }

    /// `uid:gid` owning the workspace, for running containers as the host
    /// user so their output stays removable.
    #[cfg(unix)]
    pub fn owner(&self) -> Option<String> {
        use std::os::unix::fs::MetadataExt;

        std::fs::metadata(&self.path)
            .ok()
            .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
    }

    #[cfg(not(unix))]
    pub fn owner(&self) -> Option<String> {
        None
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove workspace"
            ),
        }
    }
}
