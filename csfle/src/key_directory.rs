//! Key directory: alias → data key bindings on top of a key vault store.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, instrument};

use crate::crypto::generate_dek;
use crate::error::Error;
use crate::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore, MasterKey};
use crate::kms::KmsProviders;

/// Provisions data keys and resolves aliases to key ids.
///
/// All state lives in the key vault store; the directory itself can be
/// cloned and shared freely.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use csfle::key_directory::KeyDirectory;
/// use csfle::key_vault::{MasterKey, MemoryKeyVault};
/// use csfle::kms::{KmsProviders, LocalKms};
///
/// let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
/// let directory = KeyDirectory::new(Arc::new(MemoryKeyVault::new()), kms);
///
/// let key = directory.provision_key("fieldKey1", MasterKey::Local).unwrap();
/// assert_eq!(directory.resolve("fieldKey1").unwrap(), key.id());
/// ```
#[derive(Clone)]
pub struct KeyDirectory {
    store: Arc<dyn KeyVaultStore>,
    kms: KmsProviders,
}

impl KeyDirectory {
    /// Creates a directory over a key vault store.
    pub fn new(store: Arc<dyn KeyVaultStore>, kms: KmsProviders) -> Self {
        Self { store, kms }
    }

    /// The underlying key vault store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyVaultStore> {
        &self.store
    }

    /// Configured KMS providers.
    #[must_use]
    pub const fn kms(&self) -> &KmsProviders {
        &self.kms
    }

    /// Creates a data key bound to `alias`, wrapped under `master_key`.
    ///
    /// The key document is durable in the store before this returns.
    ///
    /// # Errors
    ///
    /// - `Error::DuplicateAlias` if the alias is already bound
    /// - `Error::Kms` if the master key's provider is missing or wrapping fails
    /// - `Error::BackendUnavailable` if the store cannot be written
    #[instrument(skip(self, master_key), fields(provider = master_key.provider()))]
    pub fn provision_key(&self, alias: &str, master_key: MasterKey) -> Result<DataEncryptionKey, Error> {
        if self.store.find_by_alias(alias)?.is_some() {
            return Err(Error::DuplicateAlias(alias.to_string()));
        }

        let dek = generate_dek();
        let wrapped = self.kms.for_master_key(&master_key)?.wrap_key(&master_key, dek.expose_secret())?;

        let key = DataEncryptionKey::new(KeyId::new_random(), vec![alias.to_string()], wrapped, master_key);
        // The store re-checks the alias, so a concurrent provision loses cleanly.
        self.store.insert_key(&key)?;

        info!(key_id = %key.id(), "data key provisioned");
        Ok(key)
    }

    /// Resolves an alias to its key id.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownAlias` if nothing is bound to `alias`.
    pub fn resolve(&self, alias: &str) -> Result<KeyId, Error> {
        self.store
            .find_by_alias(alias)?
            .map(|key| key.id())
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))
    }

    /// Looks up a key by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    pub fn key(&self, id: KeyId) -> Result<Option<DataEncryptionKey>, Error> {
        self.store.find_by_id(id)
    }

    /// Lists all keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    pub fn keys(&self) -> Result<Vec<DataEncryptionKey>, Error> {
        self.store.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KmsError;
    use crate::key_vault::MemoryKeyVault;
    use crate::kms::LocalKms;

    fn directory() -> KeyDirectory {
        let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
        KeyDirectory::new(Arc::new(MemoryKeyVault::new()), kms)
    }

    #[test]
    fn test_resolve_before_and_after_provision() {
        let directory = directory();

        assert!(matches!(directory.resolve("fieldKey1"), Err(Error::UnknownAlias(a)) if a == "fieldKey1"));

        let key = directory.provision_key("fieldKey1", MasterKey::Local).unwrap();
        assert_eq!(directory.resolve("fieldKey1").unwrap(), key.id());
        assert_eq!(directory.resolve("fieldKey1").unwrap(), key.id());
    }

    #[test]
    fn test_duplicate_alias() {
        let directory = directory();
        directory.provision_key("fieldKey1", MasterKey::Local).unwrap();

        let result = directory.provision_key("fieldKey1", MasterKey::Local);
        assert!(matches!(result, Err(Error::DuplicateAlias(_))));
        assert_eq!(directory.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_distinct_keys_per_alias() {
        let directory = directory();
        let k1 = directory.provision_key("fieldKey1", MasterKey::Local).unwrap();
        let k2 = directory.provision_key("fieldKey2", MasterKey::Local).unwrap();

        assert_ne!(k1.id(), k2.id());
        assert_ne!(k1.key_material(), k2.key_material());
        assert_eq!(directory.key(k2.id()).unwrap(), Some(k2));
    }

    #[test]
    fn test_unconfigured_provider() {
        let directory = directory();
        let aws = MasterKey::Aws { region: "us-east-1".into(), key: "alias/demo".into(), endpoint: None };

        let result = directory.provision_key("fieldKey1", aws);
        assert!(matches!(result, Err(Error::Kms(KmsError::ProviderNotConfigured(_)))));
        assert!(matches!(directory.resolve("fieldKey1"), Err(Error::UnknownAlias(_))));
    }
}
