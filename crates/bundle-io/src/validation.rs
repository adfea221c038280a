use std::path::{Component, Path, PathBuf};

use crate::BundleError;

/// Validates that an archive entry path stays inside the bundle root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_entry_path(entry: &Path) -> Result<(), BundleError> {
    if entry.as_os_str().is_empty() {
        return Err(BundleError::InvalidEntry("empty path".into()));
    }

    if entry.is_absolute() {
        return Err(BundleError::InvalidEntry(format!(
            "absolute path not allowed: {}",
            entry.display()
        )));
    }

    for component in entry.components() {
        match component {
            Component::ParentDir => {
                return Err(BundleError::InvalidEntry(format!(
                    "parent directory traversal not allowed: {}",
                    entry.display()
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(BundleError::InvalidEntry(format!(
                    "absolute path not allowed: {}",
                    entry.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates an entry name given by a caller and returns it relative to the
/// bundle root, with `.` components and trailing separators dropped.
pub(crate) fn entry_path(entry: &str) -> Result<PathBuf, BundleError> {
    let path = Path::new(entry);
    validate_entry_path(path)?;
    let normal: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if normal.as_os_str().is_empty() {
        return Err(BundleError::InvalidEntry(format!("no entry named by {entry:?}")));
    }
    Ok(normal)
}

/// `/`-joined normal components of `path`, the form entry names are
/// compared in.
pub(crate) fn entry_name(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
