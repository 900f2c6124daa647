//! Ledger connection credentials, resolved by logical name at process start.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use ledgerflow_shared::{LedgerflowError, Result};

/// Source of named secrets.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Raw secret value for `name`, or `None` if nothing is published under it.
    async fn secret(&self, name: &str) -> Result<Option<String>>;
}

/// Reads secrets from environment variables of the same name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecrets;

#[async_trait]
impl SecretsProvider for EnvSecrets {
    async fn secret(&self, name: &str) -> Result<Option<String>> {
        match std::env::var(name) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(LedgerflowError::config(format!("secret {name}: {e}"))),
        }
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

/// Connection document: `{"url": "...", "auth_token": "..."}`.
#[derive(Clone, Deserialize)]
pub struct LedgerCredentials {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for LedgerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCredentials")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl LedgerCredentials {
    /// Whether `url` points at a remote libSQL server rather than a local file.
    pub fn is_remote(&self) -> bool {
        ["libsql://", "https://", "http://", "wss://", "ws://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
    }

    /// Local database path, with an optional `file:` scheme stripped.
    pub fn local_path(&self) -> &str {
        self.url.strip_prefix("file:").unwrap_or(&self.url)
    }
}

/// Look up and parse the credential document published under `name`.
pub async fn resolve_credentials(
    provider: &dyn SecretsProvider,
    name: &str,
) -> Result<Option<LedgerCredentials>> {
    let Some(raw) = provider.secret(name).await? else {
        return Ok(None);
    };
    let creds: LedgerCredentials = serde_json::from_str(&raw)
        .map_err(|e| LedgerflowError::config(format!("secret {name} is not a credential document: {e}")))?;
    if creds.url.trim().is_empty() {
        return Err(LedgerflowError::config(format!("secret {name} has an empty url")));
    }
    Ok(Some(creds))
}
