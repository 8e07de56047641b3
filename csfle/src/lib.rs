//! # csfle
//!
//! Client-side field-level encryption for document stores. Fields named by a
//! schema are encrypted before a document leaves the client and decrypted
//! after it comes back; the store only ever sees ciphertext for them.
//!
//! ## Features
//!
//! - Deterministic encryption (AES-256-SIV) for fields queried by equality
//! - Randomized encryption (ChaCha20-Poly1305) for everything else
//! - Envelope encryption: data keys wrapped by a KMS provider (local or AWS)
//! - Data keys addressed by alias (`keyAltName`) or id
//! - JSON schema maps, including a store-side validator for encrypted fields
//! - Automatic and bypass modes, plus explicit encrypt/decrypt
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use csfle::prelude::*;
//!
//! let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key())?);
//! let config = ClientConfig::new("demoFLE.__keystore".parse()?);
//! let client = EncryptedClient::new(config, kms, Arc::new(MemoryKeyVault::new()), Arc::new(MemoryStore::new()))?;
//! client.create_key("fieldKey1", MasterKey::Local)?;
//!
//! let table = PolicyTable::define([
//!     FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "fieldKey1"),
//! ])?;
//! let client = client.with_config(
//!     client.config().clone().with_schema_map(SchemaMap::new().with_table("demoFLE.people", &table)),
//! )?;
//!
//! client.insert_one("demoFLE.people", &Document::new().with("name", "Grace").with("ssn", "901-01-0001"))?;
//! let found = client.find("demoFLE.people", &Document::new().with("ssn", "901-01-0001"))?;
//! assert_eq!(found.len(), 1);
//! # Ok::<(), csfle::Error>(())
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod ciphertext;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod key_directory;
pub mod key_vault;
pub mod kms;
pub mod policy;
pub mod schema;
pub mod store;
pub mod transform;
pub mod value;

pub use error::{Error, KmsError};

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::ciphertext::EncryptedValue;
    pub use crate::client::EncryptedClient;
    pub use crate::config::{ClientConfig, Namespace};
    pub use crate::crypto::{AeadBackend, CryptoBackend};
    pub use crate::error::{Error, KmsError};
    pub use crate::gateway::{EncryptionGateway, KeyRef};
    pub use crate::key_directory::KeyDirectory;
    pub use crate::key_vault::{DataEncryptionKey, KeyId, KeyVaultStore, MasterKey, MemoryKeyVault};
    pub use crate::kms::{KmsProvider, KmsProviders, LocalKms};
    pub use crate::policy::{Algorithm, FieldPolicy, PolicyTable};
    pub use crate::schema::{SchemaMap, SchemaNode};
    pub use crate::store::{DocumentStore, MemoryStore};
    pub use crate::transform::{DocumentTransformer, TransformMode};
    pub use crate::value::{BsonType, DateMillis, Document, Value};
}
