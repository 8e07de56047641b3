//! Encryption gateway: policy-driven and explicit encrypt/decrypt of single values.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::ciphertext::EncryptedValue;
use crate::codec::{decode_value, encode_value};
use crate::crypto::CryptoBackend;
use crate::error::Error;
use crate::key_directory::KeyDirectory;
use crate::key_vault::KeyId;
use crate::policy::{Algorithm, FieldPolicy};
use crate::value::{BsonType, Value};

/// Reference to a data key for explicit encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// Key alias (`keyAltName`)
    Alias(String),
    /// Key id
    Id(KeyId),
}

impl From<KeyId> for KeyRef {
    fn from(id: KeyId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for KeyRef {
    fn from(alias: &str) -> Self {
        Self::Alias(alias.to_string())
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alias(alias) => write!(f, "alias:{alias}"),
            Self::Id(id) => write!(f, "id:{id}"),
        }
    }
}

/// Encrypts and decrypts individual values.
///
/// The gateway holds no mutable state; clones share the same directory and
/// backend.
#[derive(Clone)]
pub struct EncryptionGateway {
    directory: KeyDirectory,
    backend: Arc<dyn CryptoBackend>,
}

impl EncryptionGateway {
    /// Creates a gateway.
    pub fn new(directory: KeyDirectory, backend: Arc<dyn CryptoBackend>) -> Self {
        Self { directory, backend }
    }

    /// The key directory used to resolve aliases.
    #[must_use]
    pub const fn directory(&self) -> &KeyDirectory {
        &self.directory
    }

    /// Encrypts a value according to its field policy.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownAlias` if the policy's key alias is unbound
    /// - `Error::TypeMismatch` if the value is not of the declared type
    ///   (an already-encrypted value never matches)
    #[instrument(level = "debug", skip(self, policy, plaintext), fields(path = policy.path()))]
    pub fn encrypt_field(&self, policy: &FieldPolicy, plaintext: &Value) -> Result<EncryptedValue, Error> {
        let key_id = self.directory.resolve(policy.key_alias())?;

        let found = plaintext.bson_type();
        if found != policy.bson_type() || plaintext.as_encrypted().is_some() {
            return Err(Error::TypeMismatch {
                path: policy.path().to_string(),
                expected: policy.bson_type(),
                found,
            });
        }

        self.encrypt_with(key_id, policy.algorithm(), plaintext)
    }

    /// Encrypts a value for an equality query against a policy field.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnqueryableField` for randomized fields, otherwise the
    /// errors of [`Self::encrypt_field`].
    pub fn encrypt_query_value(&self, policy: &FieldPolicy, plaintext: &Value) -> Result<EncryptedValue, Error> {
        if policy.algorithm() != Algorithm::Deterministic {
            return Err(Error::UnqueryableField(policy.path().to_string()));
        }
        self.encrypt_field(policy, plaintext)
    }

    /// Encrypts a value with an explicitly chosen key and algorithm.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownAlias` / `Error::UnknownKey` if the key does not exist
    /// - `Error::UnsupportedType` for null, or deterministic encryption of a
    ///   type without a stable encoding
    #[instrument(level = "debug", skip(self, plaintext), fields(key = %key))]
    pub fn encrypt_explicit(
        &self,
        key: &KeyRef,
        plaintext: &Value,
        algorithm: Algorithm,
    ) -> Result<EncryptedValue, Error> {
        let ty = plaintext.bson_type();
        if ty == BsonType::Null || (algorithm == Algorithm::Deterministic && !ty.supports_deterministic()) {
            return Err(Error::UnsupportedType { ty, algorithm });
        }

        let key_id = match key {
            KeyRef::Alias(alias) => self.directory.resolve(alias)?,
            KeyRef::Id(id) => {
                if self.directory.key(*id)?.is_none() {
                    return Err(Error::UnknownKey(id.to_string()));
                }
                *id
            }
        };

        self.encrypt_with(key_id, algorithm, plaintext)
    }

    fn encrypt_with(&self, key_id: KeyId, algorithm: Algorithm, plaintext: &Value) -> Result<EncryptedValue, Error> {
        let encoded = encode_value(plaintext);
        let encrypted = self.backend.encrypt(key_id, algorithm, plaintext.bson_type(), &encoded)?;
        debug!(%key_id, %algorithm, len = encrypted.as_bytes().len(), "value encrypted");
        Ok(encrypted)
    }

    /// Decrypts a value produced by this gateway.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownKey` if the embedded key id is not in the key vault
    /// - `Error::MalformedCiphertext` if authentication or decoding fails
    #[instrument(level = "debug", skip(self, value), fields(key_id = %value.key_id()))]
    pub fn decrypt_field(&self, value: &EncryptedValue) -> Result<Value, Error> {
        if self.directory.key(value.key_id())?.is_none() {
            return Err(Error::UnknownKey(value.key_id().to_string()));
        }

        let plaintext = self.backend.decrypt(value)?;
        decode_value(value.original_type(), &plaintext)
    }

    /// Parses and decrypts a raw stored blob.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedCiphertext` if the blob is not a ciphertext,
    /// otherwise the errors of [`Self::decrypt_field`].
    pub fn decrypt_bytes(&self, bytes: &[u8]) -> Result<Value, Error> {
        self.decrypt_field(&EncryptedValue::from_bytes(bytes)?)
    }
}
