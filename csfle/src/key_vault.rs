//! Key vault documents and the store abstraction that persists them.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Opaque 16-byte data key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Identifier length in bytes.
    pub const LEN: usize = 16;

    /// Generates a fresh random identifier. Identifiers are never reused.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses the hyphenated text form.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKey` if the text is not a key id at all.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Uuid::parse_str(text).map(Self).map_err(|_| Error::UnknownKey(text.to_string()))
    }

    /// Raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Which key management provider wrapped a data key, and with what master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum MasterKey {
    /// Locally held master key
    Local,
    /// AWS KMS customer master key
    Aws {
        /// AWS region of the key
        region: String,
        /// Key ARN or alias
        key: String,
        /// Custom endpoint, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl MasterKey {
    /// Name of the provider that owns this master key.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws { .. } => "aws",
        }
    }
}

/// A data encryption key as stored in the key vault.
///
/// The key material is wrapped by the master key's provider; unwrapped bytes
/// never appear in this document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEncryptionKey {
    #[serde(rename = "_id")]
    id: KeyId,
    key_alt_names: Vec<String>,
    #[serde(with = "base64_bytes")]
    key_material: Vec<u8>,
    master_key: MasterKey,
    creation_date: DateTime<Utc>,
}

impl DataEncryptionKey {
    /// Creates a key document.
    #[must_use]
    pub fn new(
        id: KeyId,
        key_alt_names: Vec<String>,
        key_material: Vec<u8>,
        master_key: MasterKey,
    ) -> Self {
        Self { id, key_alt_names, key_material, master_key, creation_date: Utc::now().trunc_subsecs(3) }
    }

    /// Key identifier.
    #[must_use]
    pub const fn id(&self) -> KeyId {
        self.id
    }

    /// Aliases bound to this key.
    #[must_use]
    pub fn key_alt_names(&self) -> &[String] {
        &self.key_alt_names
    }

    /// Whether `alias` is bound to this key.
    #[must_use]
    pub fn has_alias(&self, alias: &str) -> bool {
        self.key_alt_names.iter().any(|name| name == alias)
    }

    /// Wrapped key material.
    #[must_use]
    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// Master key that wrapped the material.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Creation time.
    #[must_use]
    pub const fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Durable storage for data key documents.
///
/// `insert_key` must not return before the document is durable, and must
/// reject a document that shares an alias with a stored one.
pub trait KeyVaultStore: Send + Sync {
    /// Persists a new key document.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateAlias` if an alias is already bound, or
    /// `Error::BackendUnavailable` if the store cannot be written.
    fn insert_key(&self, key: &DataEncryptionKey) -> Result<(), Error>;

    /// Finds the key bound to an alias.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn find_by_alias(&self, alias: &str) -> Result<Option<DataEncryptionKey>, Error>;

    /// Finds a key by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn find_by_id(&self, id: KeyId) -> Result<Option<DataEncryptionKey>, Error>;

    /// Lists every stored key in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn list(&self) -> Result<Vec<DataEncryptionKey>, Error>;
}

/// In-process key vault. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    keys: RwLock<Vec<DataEncryptionKey>>,
}

impl MemoryKeyVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::BackendUnavailable("key vault lock poisoned".to_string())
}

impl KeyVaultStore for MemoryKeyVault {
    fn insert_key(&self, key: &DataEncryptionKey) -> Result<(), Error> {
        let mut keys = self.keys.write().map_err(poisoned)?;
        if let Some(alias) =
            key.key_alt_names().iter().find(|alias| keys.iter().any(|k| k.has_alias(alias)))
        {
            return Err(Error::DuplicateAlias(alias.clone()));
        }
        keys.push(key.clone());
        drop(keys);
        Ok(())
    }

    fn find_by_alias(&self, alias: &str) -> Result<Option<DataEncryptionKey>, Error> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys.iter().find(|k| k.has_alias(alias)).cloned())
    }

    fn find_by_id(&self, id: KeyId) -> Result<Option<DataEncryptionKey>, Error> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys.iter().find(|k| k.id() == id).cloned())
    }

    fn list(&self) -> Result<Vec<DataEncryptionKey>, Error> {
        Ok(self.keys.read().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(alias: &str) -> DataEncryptionKey {
        DataEncryptionKey::new(KeyId::new_random(), vec![alias.to_string()], vec![1, 2, 3], MasterKey::Local)
    }

    #[test]
    fn test_key_id_display_parse() {
        let id = KeyId::new_random();
        assert_eq!(KeyId::parse(&id.to_string()).unwrap(), id);
        assert!(matches!(KeyId::parse("not-a-key"), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn test_memory_vault_lookup() {
        let vault = MemoryKeyVault::new();
        let k1 = key("fieldKey1");
        vault.insert_key(&k1).unwrap();

        assert_eq!(vault.find_by_alias("fieldKey1").unwrap(), Some(k1.clone()));
        assert_eq!(vault.find_by_id(k1.id()).unwrap(), Some(k1));
        assert_eq!(vault.find_by_alias("fieldKey2").unwrap(), None);
        assert_eq!(vault.find_by_id(KeyId::new_random()).unwrap(), None);
    }

    #[test]
    fn test_memory_vault_rejects_duplicate_alias() {
        let vault = MemoryKeyVault::new();
        vault.insert_key(&key("fieldKey1")).unwrap();

        let result = vault.insert_key(&key("fieldKey1"));
        assert!(matches!(result, Err(Error::DuplicateAlias(alias)) if alias == "fieldKey1"));
        assert_eq!(vault.list().unwrap().len(), 1);
    }

    #[test]
    fn test_key_document_json() {
        let k = DataEncryptionKey::new(
            KeyId::from_bytes([1; KeyId::LEN]),
            vec!["fieldKey1".to_string()],
            vec![0xde, 0xad],
            MasterKey::Aws {
                region: "us-east-1".to_string(),
                key: "arn:aws:kms:us-east-1:000000000000:key/demo".to_string(),
                endpoint: None,
            },
        );

        let json = serde_json::to_value(&k).unwrap();
        assert_eq!(json["_id"], "01010101-0101-0101-0101-010101010101");
        assert_eq!(json["keyAltNames"][0], "fieldKey1");
        assert_eq!(json["keyMaterial"], "3q0=");
        assert_eq!(json["masterKey"]["provider"], "aws");
        assert!(json["masterKey"].get("endpoint").is_none());

        let parsed: DataEncryptionKey = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, k);
    }
}
