use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Operation requested by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Ping,
    PersistData,
    RetrieveData,
    ProcessResponse,
    ProcessError,
}

impl Operation {
    /// All operations, in wire-declaration order.
    pub const ALL: [Operation; 5] = [
        Operation::Ping,
        Operation::PersistData,
        Operation::RetrieveData,
        Operation::ProcessResponse,
        Operation::ProcessError,
    ];

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Ping => "PING",
            Operation::PersistData => "PERSIST_DATA",
            Operation::RetrieveData => "RETRIEVE_DATA",
            Operation::ProcessResponse => "PROCESS_RESPONSE",
            Operation::ProcessError => "PROCESS_ERROR",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownOperation(s.to_string()))
    }
}

/// On-disk representation of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageFormat {
    /// A single file copied verbatim.
    SingleDataFile,
    /// A directory tree, streamed as a TAR archive.
    DataDirectory,
    /// A pre-built archive file, streamed as-is.
    ArchiveDataFile,
}

impl StorageFormat {
    pub const ALL: [StorageFormat; 3] = [
        StorageFormat::SingleDataFile,
        StorageFormat::DataDirectory,
        StorageFormat::ArchiveDataFile,
    ];

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageFormat::SingleDataFile => "SINGLE_DATA_FILE",
            StorageFormat::DataDirectory => "DATA_DIRECTORY",
            StorageFormat::ArchiveDataFile => "ARCHIVE_DATA_FILE",
        }
    }

    /// Parses a wire format name; the empty string means "no format".
    pub fn parse_optional(s: &str) -> Result<Option<Self>, ProtocolError> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some)
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownFormat(s.to_string()))
    }
}
