//! Encrypted value format.
//!
//! Every encrypted field is a self-describing blob:
//! ```text
//! [algorithm:1][key_id:16][original_type:1][payload:N]
//! ```
//! The 18-byte prefix is authenticated as associated data, so swapping the key
//! id, algorithm or type of a stored value fails decryption.

use crate::error::Error;
use crate::key_vault::KeyId;
use crate::policy::Algorithm;
use crate::value::BsonType;

/// Length of the authenticated prefix.
pub const PREFIX_LEN: usize = 1 + KeyId::LEN + 1;

/// A ciphertext produced by the encryption gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptedValue {
    algorithm: Algorithm,
    key_id: KeyId,
    original_type: BsonType,
    bytes: Vec<u8>,
}

impl EncryptedValue {
    /// Assembles a value from its parts.
    #[must_use]
    pub fn new(algorithm: Algorithm, key_id: KeyId, original_type: BsonType, payload: &[u8]) -> Self {
        let mut bytes = Self::prefix(algorithm, key_id, original_type).to_vec();
        bytes.extend_from_slice(payload);
        Self { algorithm, key_id, original_type, bytes }
    }

    /// Builds the authenticated prefix for the given parts.
    #[must_use]
    pub fn prefix(algorithm: Algorithm, key_id: KeyId, original_type: BsonType) -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix[0] = algorithm.as_u8();
        prefix[1..=KeyId::LEN].copy_from_slice(key_id.as_bytes());
        prefix[PREFIX_LEN - 1] = original_type.as_u8();
        prefix
    }

    /// Parses a stored blob.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedCiphertext` if the blob is truncated or carries
    /// an unknown algorithm or type tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() <= PREFIX_LEN {
            return Err(Error::MalformedCiphertext(format!(
                "blob too short: {} bytes (min: {})",
                bytes.len(),
                PREFIX_LEN + 1
            )));
        }

        let algorithm = Algorithm::from_u8(bytes[0]).ok_or_else(|| {
            Error::MalformedCiphertext(format!("unknown algorithm tag: {}", bytes[0]))
        })?;

        let mut id = [0u8; KeyId::LEN];
        id.copy_from_slice(&bytes[1..=KeyId::LEN]);
        let key_id = KeyId::from_bytes(id);

        let type_byte = bytes[PREFIX_LEN - 1];
        let original_type = BsonType::from_u8(type_byte).ok_or_else(|| {
            Error::MalformedCiphertext(format!("unknown original type: {type_byte:#04x}"))
        })?;

        Ok(Self { algorithm, key_id, original_type, bytes: bytes.to_vec() })
    }

    /// Encryption algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Id of the data key that encrypted this value.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Type of the plaintext.
    #[must_use]
    pub const fn original_type(&self) -> BsonType {
        self.original_type
    }

    /// The authenticated prefix.
    #[must_use]
    pub fn associated_data(&self) -> &[u8] {
        &self.bytes[..PREFIX_LEN]
    }

    /// Backend-specific payload after the prefix.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[PREFIX_LEN..]
    }

    /// The whole blob.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the value, returning the whole blob.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
