//! Built-in secret backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::reference::{CredentialReference, ProviderKind};
use super::resolver::{FetchError, SecretProvider};

/// Vault request timeout.
const VAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Field read from a Vault secret when the path names none.
const VAULT_DEFAULT_FIELD: &str = "value";

// ─── Environment ─────────────────────────────────────────────────────────────

/// Reads `secret://env/NAME` from the host environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProvider;

#[async_trait]
impl SecretProvider for EnvProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Env
    }

    async fn fetch(&self, reference: &CredentialReference) -> Result<String, FetchError> {
        match std::env::var(&reference.path) {
            Ok(value) => Ok(value),
            Err(std::env::VarError::NotPresent) => Err(FetchError::NotFound),
            Err(std::env::VarError::NotUnicode(_)) => Err(FetchError::Backend(
                "environment variable is not valid unicode".into(),
            )),
        }
    }
}

// ─── Vault ───────────────────────────────────────────────────────────────────

/// HashiCorp Vault KV v2 over HTTP.
///
/// Path format: `<mount>/<secret path>[:<field>]`, e.g.
/// `secret://vault/kv/apps/github:token#4`.
#[derive(Debug, Clone)]
pub struct VaultProvider {
    http: HttpClient,
    addr: String,
    token: String,
}

impl VaultProvider {
    pub fn new(addr: &str, token: &str) -> Result<Self, String> {
        let http = HttpClient::builder()
            .timeout(VAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build from `VAULT_ADDR` / `VAULT_TOKEN`. `Ok(None)` when Vault isn't configured.
    pub fn from_env() -> Result<Option<Self>, String> {
        let Ok(addr) = std::env::var("VAULT_ADDR") else {
            return Ok(None);
        };
        let token = std::env::var("VAULT_TOKEN").unwrap_or_default();
        Self::new(&addr, &token).map(Some)
    }

    /// Split `mount/secret/path:field` into its URL and field name.
    fn locate(&self, reference: &CredentialReference) -> Result<(String, String), FetchError> {
        let (location, field) = match reference.path.rsplit_once(':') {
            Some((location, field)) if !field.is_empty() => (location, field),
            _ => (reference.path.as_str(), VAULT_DEFAULT_FIELD),
        };

        let Some((mount, secret_path)) = location.split_once('/') else {
            return Err(FetchError::Backend(
                "vault path must be '<mount>/<secret path>'".into(),
            ));
        };

        let mut url = format!("{}/v1/{mount}/data/{secret_path}", self.addr);
        if let Some(version) = &reference.version {
            url.push_str(&format!("?version={version}"));
        }
        Ok((url, field.to_string()))
    }
}

#[async_trait]
impl SecretProvider for VaultProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vault
    }

    async fn fetch(&self, reference: &CredentialReference) -> Result<String, FetchError> {
        let (url, field) = self.locate(reference)?;

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| FetchError::Backend(format!("vault request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::Backend(format!("vault returned HTTP {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FetchError::Backend(format!("invalid vault response: {e}")))?;

        match body.pointer("/data/data").and_then(|data| data.get(&field)) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(FetchError::NotFound),
        }
    }
}
