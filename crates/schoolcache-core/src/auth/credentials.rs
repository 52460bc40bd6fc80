use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

const SERVICE_NAME: &str = "schoolcache";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SchoolCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchoolCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Lookup of credentials by school scope (see `models::credential_scope`).
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, scope: &str) -> Result<Option<SchoolCredentials>>;
}

/// Credentials kept in the OS keychain, one entry per school.
pub struct CredentialStore {
    service: String,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope: &str) -> Result<Entry> {
        Entry::new(&self.service, scope).context("Failed to create keyring entry")
    }

    /// Store credentials for a school in the OS keychain
    pub fn store(&self, scope: &str, credentials: &SchoolCredentials) -> Result<()> {
        let secret = serde_json::to_string(credentials)?;
        self.entry(scope)?
            .set_password(&secret)
            .context("Failed to store credentials in keychain")?;
        Ok(())
    }

    /// Delete stored credentials for a school
    pub fn delete(&self, scope: &str) -> Result<()> {
        self.entry(scope)?
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }

    /// Check if credentials exist for a school
    pub fn has_credentials(&self, scope: &str) -> bool {
        self.entry(scope)
            .map(|entry| entry.get_password().is_ok())
            .unwrap_or(false)
    }
}

impl CredentialSource for CredentialStore {
    fn credentials(&self, scope: &str) -> Result<Option<SchoolCredentials>> {
        match self.entry(scope)?.get_password() {
            Ok(secret) => {
                let credentials = serde_json::from_str(&secret)
                    .context("Failed to parse credentials from keychain")?;
                Ok(Some(credentials))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credentials from keychain"),
        }
    }
}

/// Credentials held in memory, for tests and for sessions that must not
/// touch the keychain.
#[derive(Default)]
pub struct MemoryCredentials {
    entries: RwLock<HashMap<String, SchoolCredentials>>,
}

impl MemoryCredentials {
    pub fn insert(&self, scope: &str, credentials: SchoolCredentials) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string(), credentials);
    }
}

impl CredentialSource for MemoryCredentials {
    fn credentials(&self, scope: &str) -> Result<Option<SchoolCredentials>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned())
    }
}
