use serde::{Deserialize, Serialize};

use crate::constants::{STATUS_ERROR, STATUS_OK};

/// Outcome of a transfer, sent back to the client once the agent is done.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub transferred_bytes: u64,
    #[serde(default)]
    pub persisted_bytes: u64,
    #[serde(default)]
    pub checksum: String,
}

impl Response {
    /// Successful response with transfer counters.
    pub fn ok(transferred_bytes: u64, persisted_bytes: u64, checksum: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK,
            message: String::new(),
            transferred_bytes,
            persisted_bytes,
            checksum: checksum.into(),
        }
    }

    /// Error response carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_response() {
        let r = Response::ok(10, 10, "abc");
        assert!(r.is_ok());
        assert_eq!(r.transferred_bytes, 10);
        assert_eq!(r.checksum, "abc");
    }

    #[test]
    fn error_response() {
        let r = Response::error("target already exists");
        assert!(!r.is_ok());
        assert_eq!(r.status, STATUS_ERROR);
        assert_eq!(r.transferred_bytes, 0);
        assert_eq!(r.message, "target already exists");
    }
}
