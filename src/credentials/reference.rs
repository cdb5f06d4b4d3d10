//! Parsing of indirect credential references.
//!
//! Syntax: `secret://<provider>/<path>[#<version>]`. Anything that does not
//! have this shape is plaintext and passes through unchanged.

use std::fmt;

use super::errors::CredentialError;

/// URI scheme that marks a value as an indirect reference.
pub const REFERENCE_SCHEME: &str = "secret://";

/// Secret backends a reference may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// AWS Secrets Manager.
    Aws,
    /// Google Cloud Secret Manager.
    Gcp,
    /// HashiCorp Vault KV v2.
    Vault,
    /// Host process environment.
    Env,
}

impl ProviderKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "aws" => Some(ProviderKind::Aws),
            "gcp" => Some(ProviderKind::Gcp),
            "vault" => Some(ProviderKind::Vault),
            "env" | "local-environment" => Some(ProviderKind::Env),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Vault => "vault",
            ProviderKind::Env => "env",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A parsed `secret://` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialReference {
    pub provider: ProviderKind,
    pub path: String,
    pub version: Option<String>,
}

impl CredentialReference {
    /// Parse `raw`, the value stored under config key `key`.
    ///
    /// - `Ok(None)`: not a reference (plaintext).
    /// - `Ok(Some(_))`: a well-formed reference to a known provider.
    /// - `Err(UnknownProvider)`: well-formed, but the provider tag is unknown.
    pub fn parse(key: &str, raw: &str) -> Result<Option<Self>, CredentialError> {
        let Some(rest) = raw.strip_prefix(REFERENCE_SCHEME) else {
            return Ok(None);
        };

        let (locator, version) = match rest.split_once('#') {
            Some((locator, version)) => (locator, Some(version)),
            None => (rest, None),
        };

        let Some((tag, path)) = locator.split_once('/') else {
            return Ok(None);
        };
        if tag.is_empty() || path.is_empty() {
            return Ok(None);
        }
        if version.is_some_and(str::is_empty) {
            return Ok(None);
        }

        let provider = ProviderKind::from_tag(tag).ok_or_else(|| CredentialError::UnknownProvider {
            key: key.to_string(),
            provider: tag.to_string(),
        })?;

        Ok(Some(Self {
            provider,
            path: path.to_string(),
            version: version.map(str::to_string),
        }))
    }
}
