//! Per-request workspaces
//!
//! Every request gets its own directory under the configured root, named by
//! a random UUID. The directory is removed when the request finishes, either
//! through `Workspace::release` or, if that is never reached, on drop.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::geteuid;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Creates isolated workspaces under a fixed root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager over `root`, creating it if it does not exist.
    ///
    /// An existing root must be a real directory owned by the effective
    /// user; group or other permission bits on it are cleared.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        match std::fs::symlink_metadata(&root) {
            Ok(meta) => secure_existing_root(&root, &meta)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&root)?;
            }
            Err(e) => return Err(e),
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace directory.
    ///
    /// Uses a non-recursive create so an already existing path fails with
    /// `AlreadyExists` instead of being shared.
    pub async fn acquire(&self) -> io::Result<Workspace> {
        let id = Uuid::new_v4();
        let path = self.root.join(id.to_string());

        tokio::fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .await?;

        debug!("Acquired workspace {}", id);
        Ok(Workspace {
            id,
            path,
            released: false,
        })
    }
}

fn secure_existing_root(root: &Path, meta: &Metadata) -> io::Result<()> {
    if meta.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("workspace root {} is a symlink", root.display()),
        ));
    }
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("workspace root {} is not a directory", root.display()),
        ));
    }

    let euid = geteuid().as_raw();
    if meta.uid() != euid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "workspace root {} is owned by uid {}, expected {}",
                root.display(),
                meta.uid(),
                euid
            ),
        ));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        warn!(
            "Workspace root {} has mode {:o}, tightening to 700",
            root.display(),
            mode
        );
        std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// A directory owned by exactly one request
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Write a new file (owner read/write only) into the workspace
    pub async fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.file(name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(path)
    }

    /// Remove the workspace. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!("Released workspace {}", self.id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.id, e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Released workspace {} on drop", self.id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {} on drop: {}", self.id, e),
        }
    }
}
