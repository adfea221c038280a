//! Filesystem helpers shared by the strategies.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::BundleError;

/// Returns the on-disk size in bytes of a file or directory tree.
///
/// Symlinks are counted by their own size and never followed. A missing path
/// has size 0.
pub fn path_size(path: &Path) -> Result<u64, BundleError> {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];

    while let Some(current) = pending.pop() {
        let meta = match fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            for entry in fs::read_dir(&current)? {
                pending.push(entry?.path());
            }
        } else {
            total += meta.len();
        }
    }

    Ok(total)
}

/// Removes a file or directory tree and returns the bytes it held.
///
/// A missing path removes nothing and returns 0. Symlinks are removed, never
/// followed.
pub fn remove_path(path: &Path) -> Result<u64, BundleError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let size = path_size(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(size)
}

/// Opens `source` for reading, mapping a missing file to
/// [`BundleError::SourceNotFound`].
pub(crate) fn open_source(source: &Path) -> Result<File, BundleError> {
    File::open(source).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BundleError::SourceNotFound(source.to_path_buf()),
        _ => BundleError::Io(e),
    })
}

/// Creates `target` as a new file, creating missing parent directories.
pub(crate) fn create_new_file(target: &Path) -> Result<File, BundleError> {
    ensure_parent(target)?;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(|e| already_exists_or_io(e, target))
}

/// Creates `target` as a new directory, creating missing parent directories.
pub(crate) fn create_new_dir(target: &Path) -> Result<(), BundleError> {
    ensure_parent(target)?;
    fs::create_dir(target).map_err(|e| already_exists_or_io(e, target))
}

pub(crate) fn ensure_parent(target: &Path) -> Result<(), BundleError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn already_exists_or_io(e: io::Error, target: &Path) -> BundleError {
    match e.kind() {
        io::ErrorKind::AlreadyExists => BundleError::AlreadyExists(target.to_path_buf()),
        _ => BundleError::Io(e),
    }
}
