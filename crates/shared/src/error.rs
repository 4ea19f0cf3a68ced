use serde::{Deserialize, Serialize};

/// Failure body every endpoint returns on a non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    pub message: String,
}

impl ApiFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
