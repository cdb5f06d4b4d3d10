//! Swaps `secret://` references for their resolved values.
//!
//! Resolution happens once per connection attempt and is never cached, so a
//! rotated secret is picked up on the next restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use super::errors::CredentialError;
use super::providers::{EnvProvider, VaultProvider};
use super::reference::{CredentialReference, ProviderKind};

/// Key-name fragments that suggest a value is a credential.
const CREDENTIAL_KEY_HINTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "key",
    "credential",
    "auth",
];

/// Why a provider could not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    NotFound,
    Backend(String),
}

/// A secret backend.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// The provider tag this backend serves.
    fn kind(&self) -> ProviderKind;

    /// Fetch the plaintext value for a reference.
    async fn fetch(&self, reference: &CredentialReference) -> Result<String, FetchError>;
}

/// Resolves maps of possibly-indirect values through registered providers.
#[derive(Clone, Default)]
pub struct CredentialResolver {
    providers: HashMap<ProviderKind, Arc<dyn SecretProvider>>,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.providers.keys().map(|k| k.tag()).collect();
        kinds.sort_unstable();
        f.debug_struct("CredentialResolver")
            .field("providers", &kinds)
            .finish()
    }
}

impl CredentialResolver {
    /// A resolver with no providers; every reference fails closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// The environment provider, plus Vault when `VAULT_ADDR` is set.
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new().with_provider(Arc::new(EnvProvider));
        match VaultProvider::from_env() {
            Ok(Some(vault)) => resolver = resolver.with_provider(Arc::new(vault)),
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!(%reason, "vault provider not registered");
            }
        }
        resolver
    }

    /// Register (or replace) the backend for its provider tag.
    pub fn with_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Resolve every value in `values` concurrently.
    ///
    /// Plaintext values pass through. Any reference that fails aborts the
    /// whole map.
    pub async fn resolve_map(
        &self,
        values: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, CredentialError> {
        let lookups = values.iter().map(|(key, value)| async move {
            let resolved = self.resolve_value(key, value).await?;
            Ok::<_, CredentialError>((key.clone(), resolved))
        });

        let resolved = try_join_all(lookups).await?;
        Ok(resolved.into_iter().collect())
    }

    /// Resolve one value stored under `key`.
    pub async fn resolve_value(&self, key: &str, value: &str) -> Result<String, CredentialError> {
        let Some(reference) = CredentialReference::parse(key, value)? else {
            if looks_like_credential(key) && !value.is_empty() {
                tracing::warn!(
                    key,
                    "plaintext value for credential-like key; prefer a secret://<provider>/<path> reference"
                );
            }
            return Ok(value.to_string());
        };

        let provider = self.providers.get(&reference.provider).ok_or_else(|| {
            CredentialError::ProviderUnavailable {
                key: key.to_string(),
                provider: reference.provider.tag().to_string(),
            }
        })?;

        match provider.fetch(&reference).await {
            Ok(secret) => {
                tracing::debug!(key, provider = %reference.provider, "resolved credential reference");
                Ok(secret)
            }
            Err(FetchError::NotFound) => Err(CredentialError::NotFound {
                key: key.to_string(),
                provider: reference.provider.tag().to_string(),
                path: reference.path.clone(),
            }),
            Err(FetchError::Backend(reason)) => Err(CredentialError::Backend {
                key: key.to_string(),
                provider: reference.provider.tag().to_string(),
                path: reference.path.clone(),
                reason,
            }),
        }
    }
}

/// Whether a key name looks like it holds a credential.
pub fn looks_like_credential(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    CREDENTIAL_KEY_HINTS.iter().any(|hint| lower.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider {
        kind: ProviderKind,
        values: HashMap<String, String>,
    }

    #[async_trait]
    impl SecretProvider for StaticProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn fetch(&self, reference: &CredentialReference) -> Result<String, FetchError> {
            self.values
                .get(&reference.path)
                .cloned()
                .ok_or(FetchError::NotFound)
        }
    }

    fn aws_with(path: &str, value: &str) -> Arc<dyn SecretProvider> {
        Arc::new(StaticProvider {
            kind: ProviderKind::Aws,
            values: HashMap::from([(path.to_string(), value.to_string())]),
        })
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_plaintext_passes_through() {
        let resolver = CredentialResolver::new();
        let out = resolver
            .resolve_map(&map(&[("LOG_LEVEL", "debug"), ("password", "hunter2")]))
            .await
            .unwrap();
        assert_eq!(out["LOG_LEVEL"], "debug");
        // credential-looking plaintext still resolves (only warns)
        assert_eq!(out["password"], "hunter2");
    }

    #[tokio::test]
    async fn test_plaintext_credential_warning_names_key_not_value() {
        let (logs, _guard) = crate::logging::capture_logs();
        let resolver = CredentialResolver::new().with_provider(aws_with("prod/api", "tok-7f3a9"));
        resolver
            .resolve_map(&map(&[
                ("DB_PASSWORD", "plain-hunter2"),
                ("API_TOKEN", "secret://aws/prod/api"),
                ("REGION", "eu-west-1"),
            ]))
            .await
            .unwrap();

        let out = logs.contents();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("DB_PASSWORD"), "{out}");
        assert!(out.contains("prefer a secret://"), "{out}");
        assert!(out.contains("resolved credential reference"), "{out}");
        assert!(!out.contains("plain-hunter2"), "{out}");
        assert!(!out.contains("tok-7f3a9"), "{out}");
        // Non-credential keys are not flagged.
        assert!(!out.contains("REGION"), "{out}");
    }

    #[tokio::test]
    async fn test_references_resolved_alongside_plaintext() {
        let resolver = CredentialResolver::new().with_provider(aws_with("prod/db", "s3cr3t"));
        let out = resolver
            .resolve_map(&map(&[
                ("DB_PASSWORD", "secret://aws/prod/db"),
                ("REGION", "eu-west-1"),
            ]))
            .await
            .unwrap();
        assert_eq!(out["DB_PASSWORD"], "s3cr3t");
        assert_eq!(out["REGION"], "eu-west-1");
    }

    #[tokio::test]
    async fn test_missing_env_reference_names_key_not_value() {
        let resolver = CredentialResolver::new().with_provider(Arc::new(EnvProvider));
        let err = resolver
            .resolve_map(&map(&[
                ("Authorization", "secret://env/MCP_BRIDGE_TEST_SURELY_UNSET_VAR"),
                ("Other", "plain"),
            ]))
            .await
            .unwrap_err();

        assert_eq!(err.key(), "Authorization");
        let msg = err.to_string();
        assert!(msg.contains("Authorization"));
        assert!(msg.contains("MCP_BRIDGE_TEST_SURELY_UNSET_VAR"));
        assert!(matches!(err, CredentialError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_provider_fails_closed() {
        let resolver = CredentialResolver::new();
        let err = resolver
            .resolve_value("TOKEN", "secret://gcp/projects/p/secrets/t")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_provider_tag_is_hard_error() {
        let resolver = CredentialResolver::with_defaults();
        let err = resolver
            .resolve_value("TOKEN", "secret://onepassword/vault/item")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::UnknownProvider { .. }));
    }

    #[test]
    fn test_looks_like_credential() {
        for key in ["password", "DB_PASSWORD", "api_key", "Authorization", "GITHUB_TOKEN", "client_secret"] {
            assert!(looks_like_credential(key), "{key}");
        }
        for key in ["PATH", "LOG_LEVEL", "region"] {
            assert!(!looks_like_credential(key), "{key}");
        }
    }
}
