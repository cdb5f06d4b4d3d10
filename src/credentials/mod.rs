//! Credential resolution for server env vars and HTTP headers.
//!
//! Values of the form `secret://<provider>/<path>[#<version>]` are looked up
//! through a registry of [`SecretProvider`]s at connection time; everything
//! else is passed through as plaintext.

pub mod errors;
pub mod providers;
pub mod reference;
pub mod resolver;

pub use errors::CredentialError;
pub use providers::{EnvProvider, VaultProvider};
pub use reference::{CredentialReference, ProviderKind, REFERENCE_SCHEME};
pub use resolver::{looks_like_credential, CredentialResolver, FetchError, SecretProvider};
