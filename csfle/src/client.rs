//! Encrypted client: configuration, keys, transformer and document store in one value.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::ciphertext::EncryptedValue;
use crate::config::ClientConfig;
use crate::crypto::{AeadBackend, CryptoBackend};
use crate::error::Error;
use crate::gateway::{EncryptionGateway, KeyRef};
use crate::key_directory::KeyDirectory;
use crate::key_vault::{DataEncryptionKey, KeyVaultStore, MasterKey};
use crate::kms::KmsProviders;
use crate::policy::{Algorithm, PolicyTable};
use crate::store::{self, DocumentStore};
use crate::transform::{DocumentTransformer, TransformMode};
use crate::value::{Document, Value};

/// A client that encrypts on write and decrypts on read according to its
/// configuration's schema map.
///
/// A client never changes mode. [`EncryptedClient::with_config`] builds a
/// sibling client sharing the key vault, the document store and the cache of
/// unwrapped data keys.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use csfle::prelude::*;
///
/// let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
/// let config = ClientConfig::new("demoFLE.__keystore".parse().unwrap());
/// let client =
///     EncryptedClient::new(config, kms, Arc::new(MemoryKeyVault::new()), Arc::new(MemoryStore::new())).unwrap();
///
/// client.create_key("fieldKey1", MasterKey::Local).unwrap();
/// let ct = client.encrypt(&"fieldKey1".into(), &Value::from("901-01-0001"), Algorithm::Deterministic).unwrap();
/// assert_eq!(client.decrypt(&ct).unwrap(), Value::from("901-01-0001"));
/// ```
pub struct EncryptedClient {
    config: ClientConfig,
    directory: KeyDirectory,
    backend: Arc<dyn CryptoBackend>,
    transformer: DocumentTransformer,
    store: Arc<dyn DocumentStore>,
    tables: BTreeMap<String, PolicyTable>,
}

impl EncryptedClient {
    /// Creates a client.
    ///
    /// `kms` must hold every provider named by the key vault's master keys;
    /// [`ClientConfig::kms_providers`] builds the ones the core knows about.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` / `Error::ConflictingPolicy` if the
    /// schema map does not describe valid policy tables.
    pub fn new(
        config: ClientConfig,
        kms: KmsProviders,
        key_vault: Arc<dyn KeyVaultStore>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, Error> {
        let directory = KeyDirectory::new(key_vault.clone(), kms.clone());
        let backend: Arc<dyn CryptoBackend> = Arc::new(AeadBackend::new(key_vault, kms));
        Self::assemble(config, directory, backend, store)
    }

    /// Creates a client over the store named by the configuration's
    /// connection target.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for an unsupported connection target,
    /// otherwise the errors of [`EncryptedClient::new`].
    pub fn connect(
        config: ClientConfig,
        kms: KmsProviders,
        key_vault: Arc<dyn KeyVaultStore>,
    ) -> Result<Self, Error> {
        let store = store::connect(config.connection_target())?;
        Self::new(config, kms, key_vault, store)
    }

    fn assemble(
        config: ClientConfig,
        directory: KeyDirectory,
        backend: Arc<dyn CryptoBackend>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, Error> {
        let tables = config
            .schema_map()
            .namespaces()
            .map(|ns| Ok((ns.to_string(), config.schema_map().policy_table(ns)?)))
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        let mode = if config.bypass_auto_encryption() { TransformMode::Bypass } else { TransformMode::Automatic };
        let gateway = EncryptionGateway::new(directory.clone(), backend.clone());
        info!(?mode, collections = tables.len(), key_vault = %config.key_vault_namespace(), "client ready");

        Ok(Self {
            transformer: DocumentTransformer::new(gateway, mode),
            config,
            directory,
            backend,
            store,
            tables,
        })
    }

    /// Builds a sibling client with a different configuration, sharing the
    /// key vault, the document store and the data key cache.
    ///
    /// # Errors
    ///
    /// See [`EncryptedClient::new`].
    pub fn with_config(&self, config: ClientConfig) -> Result<Self, Error> {
        Self::assemble(config, self.directory.clone(), self.backend.clone(), self.store.clone())
    }

    /// Configuration this client was built from.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether documents are transformed automatically.
    #[must_use]
    pub const fn mode(&self) -> TransformMode {
        self.transformer.mode()
    }

    /// Key directory over the key vault.
    #[must_use]
    pub const fn key_directory(&self) -> &KeyDirectory {
        &self.directory
    }

    /// Underlying document store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Policy table of a namespace (empty for namespaces without a schema).
    #[must_use]
    pub fn policy_table(&self, namespace: &str) -> PolicyTable {
        self.tables.get(namespace).cloned().unwrap_or_default()
    }

    /// Creates a data key bound to `alias`.
    ///
    /// # Errors
    ///
    /// See [`KeyDirectory::provision_key`].
    pub fn create_key(&self, alias: &str, master_key: MasterKey) -> Result<DataEncryptionKey, Error> {
        self.directory.provision_key(alias, master_key)
    }

    /// Inserts a document, encrypting policy fields unless bypassed.
    ///
    /// # Errors
    ///
    /// Returns transformer errors (nothing is stored), or store errors such as
    /// `Error::ValidationFailed`.
    #[instrument(skip(self, doc))]
    pub fn insert_one(&self, namespace: &str, doc: &Document) -> Result<(), Error> {
        let stored = match self.tables.get(namespace) {
            Some(table) => self.transformer.apply_encryption(doc, table)?,
            None => doc.clone(),
        };
        self.store.insert(namespace, stored)
    }

    /// Finds documents by equality filter.
    ///
    /// Filter values at deterministic policy paths are encrypted before the
    /// store sees them; results are decrypted unless bypassed.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnqueryableField` for filters on randomized fields,
    /// and decryption errors for stored values.
    #[instrument(skip(self, filter))]
    pub fn find(&self, namespace: &str, filter: &Document) -> Result<Vec<Document>, Error> {
        let filter = match self.tables.get(namespace) {
            Some(table) => self.transformer.encrypt_filter(filter, table)?,
            None => filter.clone(),
        };

        self.store
            .find(namespace, &filter)?
            .iter()
            .map(|doc| self.transformer.apply_decryption(doc))
            .collect()
    }

    /// Encrypts a value explicitly.
    ///
    /// # Errors
    ///
    /// See [`EncryptionGateway::encrypt_explicit`].
    pub fn encrypt(&self, key: &KeyRef, value: &Value, algorithm: Algorithm) -> Result<EncryptedValue, Error> {
        self.transformer.gateway().encrypt_explicit(key, value, algorithm)
    }

    /// Decrypts a value explicitly. Works in either mode.
    ///
    /// # Errors
    ///
    /// See [`EncryptionGateway::decrypt_field`].
    pub fn decrypt(&self, value: &EncryptedValue) -> Result<Value, Error> {
        self.transformer.gateway().decrypt_field(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::MemoryKeyVault;
    use crate::kms::LocalKms;
    use crate::policy::FieldPolicy;
    use crate::schema::{SchemaMap, SchemaNode};
    use crate::store::MemoryStore;
    use crate::value::BsonType;

    const PEOPLE: &str = "demoFLE.people";

    fn client() -> EncryptedClient {
        let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
        let config = ClientConfig::new("demoFLE.__keystore".parse().unwrap());
        let client =
            EncryptedClient::new(config, kms, Arc::new(MemoryKeyVault::new()), Arc::new(MemoryStore::new())).unwrap();
        client.create_key("fieldKey1", MasterKey::Local).unwrap();

        let table = PolicyTable::define([
            FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "fieldKey1"),
            FieldPolicy::new("dob", BsonType::Date, Algorithm::Randomized, "fieldKey1"),
        ])
        .unwrap();
        client.store().set_validator(PEOPLE, SchemaNode::validator_for(&table)).unwrap();

        let config = client.config().clone().with_schema_map(SchemaMap::new().with_table(PEOPLE, &table));
        client.with_config(config).unwrap()
    }

    fn grace() -> Document {
        Document::new()
            .with("firstName", "Grace")
            .with("ssn", "901-01-0001")
            .with("dob", Value::date_ymd(1989, 12, 13).unwrap())
    }

    #[test]
    fn test_connect_opens_configured_store() {
        let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
        let vault: Arc<dyn KeyVaultStore> = Arc::new(MemoryKeyVault::new());
        let config = ClientConfig::new("demoFLE.__keystore".parse().unwrap())
            .with_connection_target("memory://client-tests-connect");

        let writer = EncryptedClient::connect(config.clone(), kms.clone(), vault.clone()).unwrap();
        writer.insert_one(PEOPLE, &grace()).unwrap();

        let reader = EncryptedClient::connect(config.clone(), kms.clone(), vault.clone()).unwrap();
        assert_eq!(reader.find(PEOPLE, &Document::new()).unwrap(), vec![grace()]);

        let elsewhere = config.with_connection_target("memory://client-tests-elsewhere");
        let elsewhere = EncryptedClient::connect(elsewhere, kms, vault).unwrap();
        assert!(elsewhere.find(PEOPLE, &Document::new()).unwrap().is_empty());

        let bad = ClientConfig::new("demoFLE.__keystore".parse().unwrap()).with_connection_target("file:///tmp/db");
        let result = EncryptedClient::connect(bad, KmsProviders::new(), Arc::new(MemoryKeyVault::new()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_insert_and_find_decrypted() {
        let client = client();
        client.insert_one(PEOPLE, &grace()).unwrap();

        let found = client.find(PEOPLE, &Document::new()).unwrap();
        assert_eq!(found, vec![grace()]);

        let raw = client.store().find(PEOPLE, &Document::new()).unwrap();
        assert!(raw[0].get("ssn").unwrap().as_encrypted().is_some());
    }

    #[test]
    fn test_query_by_deterministic_field() {
        let client = client();
        client.insert_one(PEOPLE, &grace()).unwrap();
        client.insert_one(PEOPLE, &grace().with("firstName", "Alan").with("ssn", "901-01-0002")).unwrap();

        let found = client.find(PEOPLE, &Document::new().with("ssn", "901-01-0002")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("firstName"), Some(&Value::from("Alan")));
    }

    #[test]
    fn test_bypass_sibling() {
        let client = client();
        let bypass = client.with_config(client.config().clone().with_bypass(true)).unwrap();
        assert_eq!(bypass.mode(), TransformMode::Bypass);

        // Plaintext is handed to the store unchanged, so the validator rejects it
        let result = bypass.insert_one(PEOPLE, &grace());
        assert!(matches!(result, Err(Error::ValidationFailed(_))));

        let ssn = bypass.encrypt(&"fieldKey1".into(), &Value::from("901-01-0002"), Algorithm::Deterministic).unwrap();
        bypass.insert_one(PEOPLE, &Document::new().with("firstName", "Alan").with("ssn", ssn.clone())).unwrap();

        let raw = bypass.find(PEOPLE, &Document::new()).unwrap();
        assert_eq!(raw[0].get("ssn"), Some(&Value::Encrypted(ssn)));

        let decrypted = client.find(PEOPLE, &Document::new()).unwrap();
        assert_eq!(decrypted[0].get("ssn"), Some(&Value::from("901-01-0002")));
    }

    #[test]
    fn test_explicit_ciphertext_rejected_in_automatic_mode() {
        let client = client();
        let ssn = client.encrypt(&"fieldKey1".into(), &Value::from("901-01-0002"), Algorithm::Deterministic).unwrap();

        let result = client.insert_one(PEOPLE, &Document::new().with("ssn", ssn));
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
        assert!(client.store().find(PEOPLE, &Document::new()).unwrap().is_empty());
    }
}
