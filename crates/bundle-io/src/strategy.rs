use std::io::{Read, Write};
use std::path::Path;

use bundlestore_protocol::StorageFormat;

use crate::{BundleError, DataNodeInfo, TransferInfo};

/// Streams a stored bundle out as bytes.
pub trait BundleReader: Send + Sync {
    /// Formats this reader can serve.
    fn supported_formats(&self) -> &'static [StorageFormat];

    /// Writes the bundle at `source` into `out`.
    ///
    /// The returned [`TransferInfo`] describes the bytes written to `out`,
    /// which for framed formats includes the framing.
    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> Result<TransferInfo, BundleError>;

    /// Lists the bundle's entries up to `depth` levels below its root.
    ///
    /// A missing bundle lists as empty.
    fn list_content(&self, source: &Path, depth: usize) -> Result<Vec<DataNodeInfo>, BundleError>;

    /// Writes one entry of the bundle at `source` into `out`.
    ///
    /// A file entry is written verbatim. A directory entry is written as a
    /// TAR stream of its subtree, named relative to the entry. Fails with
    /// [`BundleError::EntryNotFound`] when the bundle has no such entry.
    fn read_entry(
        &self,
        _source: &Path,
        _entry: &str,
        _out: &mut dyn Write,
    ) -> Result<TransferInfo, BundleError> {
        Err(BundleError::UnsupportedEntryOperation("reading an entry"))
    }
}

/// Materializes a byte stream as a new bundle.
pub trait BundleWriter: Send + Sync {
    /// Formats this writer can produce.
    fn supported_formats(&self) -> &'static [StorageFormat];

    /// Consumes `input` to end-of-stream and stores it at `target`.
    ///
    /// Fails with [`BundleError::AlreadyExists`] if `target` exists, without
    /// touching it.
    fn write_bundle(&self, input: &mut dyn Read, target: &Path)
    -> Result<TransferInfo, BundleError>;

    /// Adds an empty directory entry to the bundle at `bundle`, creating the
    /// bundle and any missing parent entries. Returns the bytes the bundle
    /// grew by.
    fn create_directory_entry(&self, _bundle: &Path, _entry: &str) -> Result<u64, BundleError> {
        Err(BundleError::UnsupportedEntryOperation("creating an entry"))
    }

    /// Adds a file entry holding everything read from `content`. Same rules
    /// as [`BundleWriter::create_directory_entry`].
    fn create_file_entry(
        &self,
        _bundle: &Path,
        _entry: &str,
        _content: &mut dyn Read,
    ) -> Result<u64, BundleError> {
        Err(BundleError::UnsupportedEntryOperation("creating an entry"))
    }

    /// Removes an entry, and everything below it, from the bundle. Returns the
    /// bytes freed; a missing entry frees nothing.
    fn delete_entry(&self, _bundle: &Path, _entry: &str) -> Result<u64, BundleError> {
        Err(BundleError::UnsupportedEntryOperation("deleting an entry"))
    }
}
