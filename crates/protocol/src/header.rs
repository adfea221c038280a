use serde::{Deserialize, Serialize};

use crate::types::{Operation, StorageFormat};

/// Request header sent at the start of every socket exchange.
///
/// Built once per request with the `with_*` methods and never modified
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Bundle identifier (0 when the request is not tied to a bundle).
    #[serde(default)]
    pub bundle_id: u64,
    #[serde(default)]
    pub auth_token: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<StorageFormat>,
    /// Path of the bundle on the agent's storage.
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub message: String,
}

impl Header {
    /// Creates a header with default (empty) bundle id, token and message.
    pub fn new(
        operation: Operation,
        format: Option<StorageFormat>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            bundle_id: 0,
            auth_token: String::new(),
            operation,
            format,
            location: location.into(),
            message: String::new(),
        }
    }

    /// Header for a liveness ping.
    pub fn ping() -> Self {
        Self::new(Operation::Ping, None, "")
    }

    pub fn with_bundle_id(mut self, bundle_id: u64) -> Self {
        self.bundle_id = bundle_id;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
