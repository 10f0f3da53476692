use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::app::config::{CREDENTIAL_ACCOUNT_KEY, CREDENTIAL_SECRET_KEY, CREDENTIAL_SERVICE};
use crate::app::error::AppError;
use crate::app::models::Credentials;

/// Platform secret storage. Implementations live outside this crate (desktop
/// keyring); failures are never fatal to callers.
pub trait CredentialStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, AppError>;
    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), AppError>;
    fn delete(&self, service: &str, key: &str) -> Result<(), AppError>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, AppError> {
        let guard = self
            .entries
            .lock()
            .map_err(|_| AppError::system("Credential store locked", ""))?;
        Ok(guard.get(&(service.to_string(), key.to_string())).cloned())
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<(), AppError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| AppError::system("Credential store locked", ""))?;
        guard.insert((service.to_string(), key.to_string()), secret.to_string());
        Ok(())
    }

    fn delete(&self, service: &str, key: &str) -> Result<(), AppError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| AppError::system("Credential store locked", ""))?;
        guard.remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}

fn read_entry(store: &dyn CredentialStore, key: &str) -> Option<String> {
    match store.get(CREDENTIAL_SERVICE, key) {
        Ok(value) => value.filter(|value| !value.is_empty()),
        Err(err) => {
            warn!(key = %key, error = %err, "credential store read failed; treating as absent");
            None
        }
    }
}

pub fn has_saved_credentials(store: &dyn CredentialStore) -> bool {
    read_entry(store, CREDENTIAL_ACCOUNT_KEY).is_some()
}

pub fn load_saved_credentials(store: &dyn CredentialStore) -> Option<Credentials> {
    let account_id = read_entry(store, CREDENTIAL_ACCOUNT_KEY)?;
    let secret = read_entry(store, CREDENTIAL_SECRET_KEY)?;
    Some(Credentials { account_id, secret })
}

pub fn save_credentials(store: &dyn CredentialStore, credentials: &Credentials) -> bool {
    let result = store
        .set(CREDENTIAL_SERVICE, CREDENTIAL_ACCOUNT_KEY, &credentials.account_id)
        .and_then(|_| store.set(CREDENTIAL_SERVICE, CREDENTIAL_SECRET_KEY, &credentials.secret));
    if let Err(err) = result {
        warn!(error = %err, "failed to save credentials");
        return false;
    }
    true
}

pub fn forget_credentials(store: &dyn CredentialStore) {
    for key in [CREDENTIAL_ACCOUNT_KEY, CREDENTIAL_SECRET_KEY] {
        if let Err(err) = store.delete(CREDENTIAL_SERVICE, key) {
            warn!(key = %key, error = %err, "failed to delete stored credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl CredentialStore for BrokenStore {
        fn get(&self, _service: &str, _key: &str) -> Result<Option<String>, AppError> {
            Err(AppError::dependency("keyring locked", ""))
        }
        fn set(&self, _service: &str, _key: &str, _secret: &str) -> Result<(), AppError> {
            Err(AppError::dependency("keyring locked", ""))
        }
        fn delete(&self, _service: &str, _key: &str) -> Result<(), AppError> {
            Err(AppError::dependency("keyring locked", ""))
        }
    }

    #[test]
    fn saves_loads_and_forgets() {
        let store = MemoryCredentialStore::new();
        assert!(load_saved_credentials(&store).is_none());

        let creds = Credentials::new("user@example.com", "secret");
        assert!(save_credentials(&store, &creds));
        assert!(has_saved_credentials(&store));
        assert_eq!(load_saved_credentials(&store), Some(creds));

        forget_credentials(&store);
        assert!(load_saved_credentials(&store).is_none());
    }

    #[test]
    fn store_failures_read_as_absent() {
        let store = BrokenStore;
        assert!(!has_saved_credentials(&store));
        assert!(load_saved_credentials(&store).is_none());
        assert!(!save_credentials(&store, &Credentials::new("a", "b")));
        forget_credentials(&store);
    }
}
