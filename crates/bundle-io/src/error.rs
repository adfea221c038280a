use std::path::PathBuf;

use bundlestore_protocol::StorageFormat;

/// Errors produced by bundle readers, writers and the strategy registry.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("target {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("no bundle found at {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("invalid archive entry: {0}")]
    InvalidEntry(String),

    #[error("no entry {0} in bundle")]
    EntryNotFound(String),

    #[error("{0} is not supported by this bundle format")]
    UnsupportedEntryOperation(&'static str),

    #[error("no bundle strategy registered for format {0}")]
    NoStrategy(String),

    #[error("more than one bundle strategy registered for format {0}")]
    AmbiguousStrategy(StorageFormat),
}

impl BundleError {
    pub(crate) fn no_strategy(format: Option<StorageFormat>) -> Self {
        match format {
            Some(format) => BundleError::NoStrategy(format.to_string()),
            None => BundleError::NoStrategy("<none>".into()),
        }
    }
}
