//! AEAD cryptographic backend.
//!
//! Each data key is 64 random bytes, wrapped by a KMS provider and unwrapped
//! on first use. The two algorithms use the key differently:
//!
//! - **Deterministic**: AES-256-SIV keyed with all 64 bytes and no nonce, so
//!   the same key, type and plaintext always give the same ciphertext. This
//!   is what makes equality queries on ciphertext possible, and it is also
//!   exactly the equality pattern an observer learns.
//! - **Randomized**: ChaCha20-Poly1305 keyed with an HKDF-SHA256 subkey and a
//!   fresh 96-bit nonce per call.
//!
//! In both cases the ciphertext prefix (algorithm, key id, type) is the
//! associated data.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes_siv::Aes256SivAead;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::ciphertext::EncryptedValue;
use crate::error::{Error, KmsError};
use crate::key_vault::{KeyId, KeyVaultStore};
use crate::kms::KmsProviders;
use crate::policy::Algorithm;
use crate::value::BsonType;

/// Data key size in bytes (512 bits, as AES-256-SIV requires).
pub const DEK_SIZE: usize = 64;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

const RANDOMIZED_KEY_INFO: &[u8] = b"csfle/randomized/chacha20poly1305";

/// Generates a random data key. Wrap it before it goes anywhere.
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}

/// Derives the 256-bit ChaCha20-Poly1305 key used by the randomized algorithm.
///
/// # Errors
///
/// Returns `Error::MalformedCiphertext` only if HKDF rejects the output size,
/// which cannot happen for 32 bytes.
pub fn derive_randomized_key(dek: &SecretVec<u8>) -> Result<Zeroizing<[u8; 32]>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, dek.expose_secret());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(RANDOMIZED_KEY_INFO, &mut key[..])
        .map_err(|_| Error::MalformedCiphertext("key derivation failed".to_string()))?;
    Ok(key)
}

/// Performs the actual encryption for a key id and algorithm.
///
/// Implementations resolve key ids to key material themselves; callers only
/// ever pass ids.
pub trait CryptoBackend: Send + Sync {
    /// Encrypts an encoded plaintext of `original_type`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownKey` if the key id cannot be found, or a KMS error
    /// if its material cannot be unwrapped.
    fn encrypt(
        &self,
        key_id: KeyId,
        algorithm: Algorithm,
        original_type: BsonType,
        plaintext: &[u8],
    ) -> Result<EncryptedValue, Error>;

    /// Decrypts a value, returning the encoded plaintext.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedCiphertext` if authentication fails.
    fn decrypt(&self, value: &EncryptedValue) -> Result<Zeroizing<Vec<u8>>, Error>;
}

/// Backend built on AES-256-SIV and ChaCha20-Poly1305.
///
/// Unwrapped data keys are cached for the life of the backend; keys are
/// immutable so the cache never goes stale.
pub struct AeadBackend {
    keys: Arc<dyn KeyVaultStore>,
    kms: KmsProviders,
    cache: RwLock<HashMap<KeyId, Arc<SecretVec<u8>>>>,
}

impl AeadBackend {
    /// Creates a backend reading wrapped keys from `keys`.
    pub fn new(keys: Arc<dyn KeyVaultStore>, kms: KmsProviders) -> Self {
        Self { keys, kms, cache: RwLock::new(HashMap::new()) }
    }

    fn data_key(&self, key_id: KeyId) -> Result<Arc<SecretVec<u8>>, Error> {
        if let Some(dek) = self.cache.read().map_err(poisoned)?.get(&key_id) {
            return Ok(Arc::clone(dek));
        }

        let doc = self.keys.find_by_id(key_id)?.ok_or_else(|| Error::UnknownKey(key_id.to_string()))?;
        let dek = self.kms.for_master_key(doc.master_key())?.unwrap_key(doc.master_key(), doc.key_material())?;
        if dek.expose_secret().len() != DEK_SIZE {
            return Err(KmsError::UnwrapFailed(format!(
                "unwrapped key {key_id} has {} bytes (expected {DEK_SIZE})",
                dek.expose_secret().len()
            ))
            .into());
        }
        debug!(%key_id, provider = doc.master_key().provider(), "data key unwrapped");

        let dek = Arc::new(dek);
        self.cache.write().map_err(poisoned)?.insert(key_id, Arc::clone(&dek));
        Ok(dek)
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::BackendUnavailable("data key cache lock poisoned".to_string())
}

impl CryptoBackend for AeadBackend {
    fn encrypt(
        &self,
        key_id: KeyId,
        algorithm: Algorithm,
        original_type: BsonType,
        plaintext: &[u8],
    ) -> Result<EncryptedValue, Error> {
        let dek = self.data_key(key_id)?;
        let aad = EncryptedValue::prefix(algorithm, key_id, original_type);

        let payload = match algorithm {
            Algorithm::Deterministic => {
                let cipher = Aes256SivAead::new_from_slice(dek.expose_secret())
                    .map_err(|e| Error::BackendUnavailable(format!("invalid AES-SIV key: {e}")))?;

                // AES-SIV derives its IV from the input; the nonce stays empty.
                cipher
                    .encrypt(&Default::default(), Payload { msg: plaintext, aad: &aad })
                    .map_err(|e| Error::BackendUnavailable(format!("AES-SIV encryption failed: {e}")))?
            }
            Algorithm::Randomized => {
                let key = derive_randomized_key(&dek)?;
                let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
                    .map_err(|e| Error::BackendUnavailable(format!("invalid ChaCha20 key: {e}")))?;

                let mut nonce_bytes = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);

                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad: &aad })
                    .map_err(|e| {
                        Error::BackendUnavailable(format!("ChaCha20-Poly1305 encryption failed: {e}"))
                    })?;

                let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                payload.extend_from_slice(&nonce_bytes);
                payload.extend_from_slice(&ciphertext);
                payload
            }
        };

        Ok(EncryptedValue::new(algorithm, key_id, original_type, &payload))
    }

    fn decrypt(&self, value: &EncryptedValue) -> Result<Zeroizing<Vec<u8>>, Error> {
        let dek = self.data_key(value.key_id())?;
        let aad = value.associated_data();

        let plaintext = match value.algorithm() {
            Algorithm::Deterministic => {
                let cipher = Aes256SivAead::new_from_slice(dek.expose_secret())
                    .map_err(|e| Error::BackendUnavailable(format!("invalid AES-SIV key: {e}")))?;

                cipher
                    .decrypt(&Default::default(), Payload { msg: value.payload(), aad })
                    .map_err(|_| Error::MalformedCiphertext("authentication failed".to_string()))?
            }
            Algorithm::Randomized => {
                let key = derive_randomized_key(&dek)?;
                let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
                    .map_err(|e| Error::BackendUnavailable(format!("invalid ChaCha20 key: {e}")))?;

                if value.payload().len() <= NONCE_SIZE {
                    return Err(Error::MalformedCiphertext("randomized payload truncated".to_string()));
                }
                let (nonce, ciphertext) = value.payload().split_at(NONCE_SIZE);

                cipher
                    .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                    .map_err(|_| Error::MalformedCiphertext("authentication failed".to_string()))?
            }
        };

        Ok(Zeroizing::new(plaintext))
    }
}
