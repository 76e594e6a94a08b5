//! Server file tree.
//!
//! Every remote path is resolved under a single root directory:
//! - Remote paths are normalized lexically; absolute paths and `..`
//!   components that climb above the root are rejected
//! - Directories are materialized on demand for uploads
//! - Resolved locations are re-checked after canonicalization so a symlink
//!   inside the tree cannot lead outside of it
//! - Concurrent sessions on the same path are serialized by a per-path lock

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, trace};

use crate::error::PathError;
use crate::protocol::parser::Permission;

/// Mode for the root directory created at startup
pub const ROOT_DIR_MODE: u32 = 0o755;

type PathLock = Arc<RwLock<()>>;

/// Process-wide view of the directory tree served to clients
pub struct FileTree {
    /// Canonical root directory
    root: PathBuf,
    /// Mode for directories created while preparing uploads
    dir_mode: u32,
    /// Whether RM may remove non-empty directories
    recursive_delete: bool,
    /// Lock per resolved path; entries are pruned once unused
    locks: Mutex<HashMap<PathBuf, PathLock>>,
}

impl FileTree {
    /// Create the root directory if needed and open the tree.
    pub async fn open(
        root: impl AsRef<Path>,
        dir_mode: u32,
        recursive_delete: bool,
    ) -> io::Result<Arc<Self>> {
        let root = root.as_ref();
        create_dirs(root, ROOT_DIR_MODE).await?;
        let root = tokio::fs::canonicalize(root).await?;
        info!(root = %root.display(), recursive_delete, "Opened server root");

        Ok(Arc::new(Self {
            root,
            dir_mode,
            recursive_delete,
            locks: Mutex::new(HashMap::new()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client-supplied remote path to a location under the root.
    ///
    /// Purely lexical: nothing is touched on disk.
    pub fn resolve(&self, remote: &str) -> Result<PathBuf, PathError> {
        let mut relative = PathBuf::new();

        for component in Path::new(remote).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(PathError::Absolute(remote.to_string()))
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(PathError::EscapesRoot(remote.to_string()));
                    }
                }
                Component::Normal(part) => relative.push(part),
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }

        let path = self.root.join(relative);
        trace!(remote, path = %path.display(), "Resolved");
        Ok(path)
    }

    /// Make sure every directory above `path` exists and lies inside the
    /// root. Pre-existing directories are left as they are.
    pub async fn prepare_parent(&self, path: &Path) -> Result<(), PathError> {
        let parent = parent_of(path);
        create_dirs(parent, self.dir_mode)
            .await
            .map_err(|source| PathError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        self.confine_parent(path).await
    }

    /// Check that the directory holding `path` is inside the root. A missing
    /// parent passes; the following file operation will fail on its own.
    pub async fn confine_parent(&self, path: &Path) -> Result<(), PathError> {
        let parent = parent_of(path);
        match tokio::fs::canonicalize(parent).await {
            Ok(canonical) => self.check_inside(&canonical, path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PathError::Io {
                path: parent.to_path_buf(),
                source,
            }),
        }
    }

    /// Follow `path` through any symlinks and check the target is inside the
    /// root. Returns the path to open.
    pub async fn confine_existing(&self, path: &Path) -> Result<PathBuf, PathError> {
        match tokio::fs::canonicalize(path).await {
            Ok(canonical) => {
                self.check_inside(&canonical, path)?;
                Ok(canonical)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path.to_path_buf()),
            Err(source) => Err(PathError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn check_inside(&self, canonical: &Path, requested: &Path) -> Result<(), PathError> {
        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(PathError::EscapesRoot(requested.display().to_string()))
        }
    }

    /// Remove a file, or a directory. Directories must be empty unless
    /// recursive deletion is enabled. Read-only files are refused.
    pub async fn delete(&self, path: &Path) -> io::Result<()> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            if self.recursive_delete {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_dir(path).await?;
            }
        } else {
            if meta.permissions().readonly() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "file is read-only",
                ));
            }
            tokio::fs::remove_file(path).await?;
        }
        debug!(path = %path.display(), "Deleted");
        Ok(())
    }

    /// Shared lock for reading `path`.
    pub async fn lock_shared(&self, path: &Path) -> OwnedRwLockReadGuard<()> {
        self.lock_for(path).read_owned().await
    }

    /// Exclusive lock for replacing or removing `path`.
    pub async fn lock_exclusive(&self, path: &Path) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(path).write_owned().await
    }

    fn lock_for(&self, path: &Path) -> PathLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Nobody else holds a clone of these
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Transfer destination under construction. The partial file sits beside the
/// destination and is removed when dropped unless committed.
pub struct PartFile {
    pub path: PathBuf,
    committed: bool,
}

impl PartFile {
    pub fn beside(dest: &Path) -> Self {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: dest.with_file_name(format!(".{name}.part")),
            committed: false,
        }
    }

    /// Move the finished file over the destination.
    pub async fn commit(mut self, dest: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            // Blocking unlink: the file must be gone before the caller continues
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Create `dir` and any missing ancestors with `mode`.
pub async fn create_dirs(dir: &Path, mode: u32) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir).await
}

/// Apply an upload permission to a stored file.
pub async fn apply_permission(path: &Path, permission: Permission) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(permission.mode())).await
    }
    #[cfg(not(unix))]
    {
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_readonly(permission == Permission::ReadOnly);
        tokio::fs::set_permissions(path, perms).await
    }
}

/// Whether `path` exists and is a directory.
pub async fn is_directory(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Whether an existing file refuses modification. Missing files do not.
pub async fn is_read_only(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().readonly(),
        Err(_) => false,
    }
}
