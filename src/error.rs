// src/error.rs

use std::time::Duration;
use thiserror::Error;

/// Every way a gateway request can fail.
///
/// `Display` carries the full diagnostic and is what gets logged.
/// [`GatewayError::client_message`] is what crosses the boundary; for
/// `Forbidden` it deliberately says nothing about which domains exist.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("{capability} not found")]
    BackendUnavailable { capability: String },

    #[error("{action} timed out after {}s", after.as_secs())]
    Timeout { action: String, after: Duration },

    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("settings persisted but reload failed: {message}")]
    ReloadFailed { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}

impl GatewayError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { field, reason: reason.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// The message the panel shows to the user.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation { field, reason } => format!("Invalid {}: {}", field, reason),
            // 🛡️ Never leak the domain set of the caller (or anyone else).
            Self::Forbidden { .. } => {
                "You do not have permission to manage cache for this domain.".to_string()
            }
            Self::UnknownAction(action) => format!("Unknown action: {}", action),
            Self::BackendUnavailable { capability } => format!("{} not found", capability),
            Self::Timeout { action, after } => format!(
                "The {} operation timed out after {}s; it is safe to retry",
                action,
                after.as_secs()
            ),
            Self::Backend { message } => message.clone(),
            Self::ReloadFailed { message } => format!(
                "Settings could not be applied and were rolled back; the cache configuration may be inconsistent until the next successful reload: {}",
                message
            ),
            Self::Storage { message } => format!("Settings storage failed: {}", message),
        }
    }

    /// Callers may repeat the request unchanged; every backend command is idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::BackendUnavailable { .. })
    }
}
