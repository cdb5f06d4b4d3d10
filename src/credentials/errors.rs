//! Credential resolution error types.
//!
//! Messages name the key, provider, and path that failed. They never carry a
//! secret value.

use thiserror::Error;

/// Errors that can occur while resolving `secret://` references.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The reference names a provider tag this crate does not know.
    #[error("'{key}': unknown credential provider '{provider}'")]
    UnknownProvider { key: String, provider: String },

    /// The provider tag is known but no backend is registered for it.
    #[error("'{key}': credential provider '{provider}' is unavailable")]
    ProviderUnavailable { key: String, provider: String },

    /// The backend answered but has no secret at that path/version.
    #[error("'{key}': secret not found at {provider}/{path}")]
    NotFound {
        key: String,
        provider: String,
        path: String,
    },

    /// The backend could not be reached or returned something unusable.
    #[error("'{key}': {provider}/{path} failed: {reason}")]
    Backend {
        key: String,
        provider: String,
        path: String,
        reason: String,
    },
}

impl CredentialError {
    /// The config key whose reference failed.
    pub fn key(&self) -> &str {
        match self {
            CredentialError::UnknownProvider { key, .. }
            | CredentialError::ProviderUnavailable { key, .. }
            | CredentialError::NotFound { key, .. }
            | CredentialError::Backend { key, .. } => key,
        }
    }
}
