//! Permission-aware filesystem helpers for the unpack cache.
//!
//! Unpacked content is made read-only; deletion restores write access first.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

pub const READ_ONLY_FILE_MODE: u32 = 0o400;
pub const READ_ONLY_DIR_MODE: u32 = 0o500;
pub const WRITABLE_MODE: u32 = 0o700;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{path:?} is not a directory")]
    NotDirectory { path: PathBuf },
    #[error("{path:?}: refusing to change permissions of special file")]
    SpecialFile { path: PathBuf },
    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: io::Error) -> Self {
        FsError::Io { path: path.to_path_buf(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Modification time of the directory at `path`.
pub fn directory_mod_time(path: &Path) -> Result<SystemTime, FsError> {
    let md = fs::metadata(path).map_err(|e| FsError::io(path, e))?;
    if !md.is_dir() {
        return Err(FsError::NotDirectory { path: path.to_path_buf() });
    }
    md.modified().map_err(|e| FsError::io(path, e))
}

/// Leave an empty directory with `mode` at `path`, removing anything inside it.
pub fn ensure_empty_directory(path: &Path, mode: u32) -> Result<(), FsError> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => {
            set_mode(path, WRITABLE_MODE)?;
            for entry in fs::read_dir(path).map_err(|e| FsError::io(path, e))? {
                let entry = entry.map_err(|e| FsError::io(path, e))?;
                delete_read_only_recursive(&entry.path())?;
            }
        }
        Ok(_) => {
            delete_read_only_recursive(path)?;
            create_dir(path, mode)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir(path, mode)?,
        Err(e) => return Err(FsError::io(path, e)),
    }
    set_mode(path, mode)
}

fn create_dir(path: &Path, mode: u32) -> Result<(), FsError> {
    fs::DirBuilder::new().recursive(true).mode(mode).create(path).map_err(|e| FsError::io(path, e))
}

fn set_mode(path: &Path, mode: u32) -> Result<(), FsError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| FsError::io(path, e))
}

/// Files become 0400 and directories 0500. Symlinks are left alone.
pub fn set_read_only_recursive(root: &Path) -> Result<(), FsError> {
    walk_set_mode(root, READ_ONLY_FILE_MODE, READ_ONLY_DIR_MODE)
}

/// Everything becomes 0700 so the tree can be modified or removed.
pub fn set_writable_recursive(root: &Path) -> Result<(), FsError> {
    walk_set_mode(root, WRITABLE_MODE, WRITABLE_MODE)
}

fn walk_set_mode(path: &Path, file_mode: u32, dir_mode: u32) -> Result<(), FsError> {
    let md = fs::symlink_metadata(path).map_err(|e| FsError::io(path, e))?;
    let ft = md.file_type();
    if ft.is_symlink() {
        return Ok(());
    }
    if ft.is_file() {
        return set_mode(path, file_mode);
    }
    if !ft.is_dir() {
        return Err(FsError::SpecialFile { path: path.to_path_buf() });
    }
    // Open the directory up before descending so listing never fails on 0000 dirs.
    set_mode(path, WRITABLE_MODE)?;
    for entry in fs::read_dir(path).map_err(|e| FsError::io(path, e))? {
        let entry = entry.map_err(|e| FsError::io(path, e))?;
        walk_set_mode(&entry.path(), file_mode, dir_mode)?;
    }
    set_mode(path, dir_mode)
}

/// Remove `path` and everything below it, clearing read-only bits first.
/// A missing path is not an error.
pub fn delete_read_only_recursive(path: &Path) -> Result<(), FsError> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(FsError::io(path, e)),
    };
    if !md.is_dir() {
        return fs::remove_file(path).map_err(|e| FsError::io(path, e));
    }
    set_writable_recursive(path)?;
    fs::remove_dir_all(path).map_err(|e| FsError::io(path, e))
}
