//! Secret retrieval.
//!
//! Credentials never live in the gateway's configuration files. A
//! [`SecretProvider`] resolves them by name at startup; the environment-backed
//! provider covers platforms that inject managed secrets as variables.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Resolves named secrets.
pub trait SecretProvider: Send + Sync {
    fn get_secret(&self, name: &str) -> impl Future<Output = DbResult<String>> + Send;
}

/// Reads secrets from environment variables.
///
/// A secret named `oracle-url` is looked up as `<PREFIX>ORACLE_URL`.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a secret.
    pub fn variable_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> DbResult<String> {
        let var = self.variable_name(name);
        debug!(secret = %name, variable = %var, "Resolving secret from environment");
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(DbError::secret_not_found(name)),
        }
    }
}

/// In-memory secrets, for tests and embedded use.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> DbResult<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::secret_not_found(name))
    }
}

/// Pick the database connection string: a named secret wins over a literal.
pub async fn resolve_connection_string<P: SecretProvider>(
    provider: &P,
    secret_name: Option<&str>,
    literal: Option<&str>,
) -> DbResult<String> {
    match (secret_name, literal) {
        (Some(name), _) => provider.get_secret(name).await,
        (None, Some(url)) => Ok(url.to_string()),
        (None, None) => Err(DbError::configuration(
            "no database configured: pass --database or --database-secret",
        )),
    }
}
