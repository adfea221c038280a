use serde::{Deserialize, Serialize};

/// Result of one reader or writer invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    /// Bytes that crossed the stream.
    pub num_bytes: u64,
    /// Lowercase hex SHA-256 of those bytes.
    pub checksum: String,
}

/// One entry of a bundle content listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNodeInfo {
    /// Path relative to the bundle root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub collection: bool,
}

impl DataNodeInfo {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            collection: false,
        }
    }

    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            collection: true,
        }
    }
}
