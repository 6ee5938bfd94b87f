use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::LockError;

/// Exclusive ownership of a working copy for the duration of one run.
///
/// Backed by `.<name>.gated-repair.lock` next to the working copy so the
/// lock file never shows up in diffs or test runs. Released on drop.
#[derive(Debug)]
pub struct WorkingCopyLock {
    _file: File,
    path: PathBuf,
}

impl WorkingCopyLock {
    /// Lock file location for `working_copy`.
    pub fn lock_path(working_copy: &Path) -> PathBuf {
        let name = working_copy
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workdir".to_string());
        let parent = working_copy.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!(".{name}.gated-repair.lock"))
    }

    /// Try to acquire the lock without blocking.
    ///
    /// The working copy itself may not exist yet (checkout creates it), but
    /// its parent directory is created here.
    pub fn acquire(working_copy: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(working_copy);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Busy(working_copy.to_path_buf()))?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
