//! Bundle format strategies.
//!
//! A bundle lives on an agent's storage in one of the [`StorageFormat`]s.
//! Readers stream a bundle into a byte sink and writers materialize a byte
//! stream as a new bundle. Both are synchronous and meant to run on a
//! blocking thread; the transfer service bridges them to async pipes.

mod archive;
mod checksum;
mod data_directory;
mod error;
mod fs;
mod registry;
mod single_file;
mod strategy;
mod types;
mod validation;

pub use archive::ArchiveFileBundleIo;
pub use checksum::{HashingReader, HashingWriter, checksum_bytes};
pub use data_directory::DataDirectoryBundleIo;
pub use error::BundleError;
pub use fs::{path_size, remove_path};
pub use registry::BundleIoRegistry;
pub use single_file::SingleFileBundleIo;
pub use strategy::{BundleReader, BundleWriter};
pub use types::{DataNodeInfo, TransferInfo};
pub use validation::validate_entry_path;

pub use bundlestore_protocol::StorageFormat;

/// Buffer size used when copying bundle bytes.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;
