//! Document transformer: applies the gateway to every policy path of a document.

use tracing::{debug, instrument};

use crate::error::Error;
use crate::gateway::EncryptionGateway;
use crate::policy::PolicyTable;
use crate::value::{Document, Value};

/// Whether the transformer rewrites documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransformMode {
    /// Encrypt on write, decrypt on read
    #[default]
    Automatic,
    /// Pass documents through unchanged; callers encrypt explicitly
    Bypass,
}

/// Rewrites whole documents through an [`EncryptionGateway`].
///
/// Results are built off to the side: an error anywhere in a document means
/// no part of the transformed document is returned.
#[derive(Clone)]
pub struct DocumentTransformer {
    gateway: EncryptionGateway,
    mode: TransformMode,
}

impl DocumentTransformer {
    /// Creates a transformer.
    pub const fn new(gateway: EncryptionGateway, mode: TransformMode) -> Self {
        Self { gateway, mode }
    }

    /// Returns a transformer sharing this gateway with a different mode.
    #[must_use]
    pub fn with_mode(&self, mode: TransformMode) -> Self {
        Self { gateway: self.gateway.clone(), mode }
    }

    /// Current mode.
    #[must_use]
    pub const fn mode(&self) -> TransformMode {
        self.mode
    }

    /// The gateway used for field operations.
    #[must_use]
    pub const fn gateway(&self) -> &EncryptionGateway {
        &self.gateway
    }

    /// Encrypts every field of `doc` whose dotted path has a policy.
    ///
    /// Field order and shape are preserved. Paths are matched segment by
    /// segment: a field whose own name contains a dot is never at a policy
    /// path. Arrays are leaves: documents inside arrays are not addressed by
    /// dotted paths.
    ///
    /// # Errors
    ///
    /// Returns the first field error; see [`EncryptionGateway::encrypt_field`].
    #[instrument(level = "debug", skip_all, fields(policies = table.len()))]
    pub fn apply_encryption(&self, doc: &Document, table: &PolicyTable) -> Result<Document, Error> {
        if self.mode == TransformMode::Bypass || table.is_empty() {
            return Ok(doc.clone());
        }
        self.encrypt_fields("", doc, table, false)
    }

    /// Encrypts the values of an equality filter at policy paths.
    ///
    /// Filter keys may be dotted paths (`contact.email`) or nested documents.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnqueryableField` if the filter names a randomized
    /// field, otherwise the errors of [`Self::apply_encryption`].
    #[instrument(level = "debug", skip_all)]
    pub fn encrypt_filter(&self, filter: &Document, table: &PolicyTable) -> Result<Document, Error> {
        if self.mode == TransformMode::Bypass || table.is_empty() {
            return Ok(filter.clone());
        }
        self.encrypt_fields("", filter, table, true)
    }

    fn encrypt_fields(
        &self,
        prefix: &str,
        doc: &Document,
        table: &PolicyTable,
        query: bool,
    ) -> Result<Document, Error> {
        let mut out = Document::new();

        for (name, value) in doc.iter() {
            let path = if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") };

            // Only filters may spell a nested path as one dotted key
            if !query && name.contains('.') {
                debug!(field = name, "dotted field name left as is");
                out.insert(name, value.clone());
                continue;
            }

            let transformed = match (table.lookup(&path), value) {
                (Some(policy), value) if query => Value::Encrypted(self.gateway.encrypt_query_value(policy, value)?),
                (Some(policy), value) => {
                    debug!(path = %path, algorithm = %policy.algorithm(), "encrypting field");
                    Value::Encrypted(self.gateway.encrypt_field(policy, value)?)
                }
                (None, Value::Document(child)) => Value::Document(self.encrypt_fields(&path, child, table, query)?),
                (None, value) => value.clone(),
            };
            out.insert(name, transformed);
        }

        Ok(out)
    }

    /// Decrypts every encrypted value of `doc`, including inside arrays.
    ///
    /// # Errors
    ///
    /// Returns the first field error; see [`EncryptionGateway::decrypt_field`].
    #[instrument(level = "debug", skip_all)]
    pub fn apply_decryption(&self, doc: &Document) -> Result<Document, Error> {
        if self.mode == TransformMode::Bypass {
            return Ok(doc.clone());
        }
        self.decrypt_document(doc)
    }

    fn decrypt_document(&self, doc: &Document) -> Result<Document, Error> {
        doc.iter()
            .map(|(name, value)| Ok((name.to_string(), self.decrypt_value(value)?)))
            .collect()
    }

    fn decrypt_value(&self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Encrypted(encrypted) => self.gateway.decrypt_field(encrypted),
            Value::Document(doc) => Ok(Value::Document(self.decrypt_document(doc)?)),
            Value::Array(items) => {
                let items = items.iter().map(|item| self.decrypt_value(item)).collect::<Result<_, _>>()?;
                Ok(Value::Array(items))
            }
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::crypto::AeadBackend;
    use crate::key_directory::KeyDirectory;
    use crate::key_vault::{MasterKey, MemoryKeyVault};
    use crate::kms::{KmsProviders, LocalKms};
    use crate::policy::{Algorithm, FieldPolicy};
    use crate::value::{BsonType, DateMillis};
    use chrono::DateTime;

    fn transformer() -> DocumentTransformer {
        let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key()).unwrap());
        let store = Arc::new(MemoryKeyVault::new());
        let directory = KeyDirectory::new(store.clone(), kms.clone());
        directory.provision_key("fieldKey1", MasterKey::Local).unwrap();
        directory.provision_key("fieldKey2", MasterKey::Local).unwrap();
        let gateway = EncryptionGateway::new(directory, Arc::new(AeadBackend::new(store, kms)));
        DocumentTransformer::new(gateway, TransformMode::Automatic)
    }

    fn people_table() -> PolicyTable {
        PolicyTable::define([
            FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "fieldKey1"),
            FieldPolicy::new("dob", BsonType::Date, Algorithm::Randomized, "fieldKey1"),
            FieldPolicy::new("contact.email", BsonType::String, Algorithm::Deterministic, "fieldKey2"),
            FieldPolicy::new("contact.mobile", BsonType::String, Algorithm::Deterministic, "fieldKey2"),
        ])
        .unwrap()
    }

    fn grace() -> Document {
        Document::new()
            .with("firstName", "Grace")
            .with("lastName", "Hopper")
            .with("ssn", "901-01-0001")
            .with("dob", Value::date_ymd(1989, 12, 13).unwrap())
            .with(
                "address",
                Document::new()
                    .with("street", "123 Main Street")
                    .with("city", "Omaha")
                    .with("state", "Nebraska")
                    .with("zip", "90210"),
            )
            .with("contact", Document::new().with("mobile", "202-555-1212").with("email", "grace@example.com"))
    }

    #[test]
    fn test_encrypts_policy_paths_only() {
        let transformer = transformer();
        let encrypted = transformer.apply_encryption(&grace(), &people_table()).unwrap();

        assert!(encrypted.get("ssn").unwrap().as_encrypted().is_some());
        assert!(encrypted.get("dob").unwrap().as_encrypted().is_some());
        assert!(encrypted.get_path("contact.email").unwrap().as_encrypted().is_some());
        assert!(encrypted.get_path("contact.mobile").unwrap().as_encrypted().is_some());
        assert_eq!(encrypted.get("firstName"), grace().get("firstName"));
        assert_eq!(encrypted.get("address"), grace().get("address"));

        let names: Vec<_> = encrypted.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["firstName", "lastName", "ssn", "dob", "address", "contact"]);
    }

    #[test]
    fn test_round_trip_is_identity() {
        let transformer = transformer();
        let encrypted = transformer.apply_encryption(&grace(), &people_table()).unwrap();
        assert_eq!(transformer.apply_decryption(&encrypted).unwrap(), grace());
    }

    #[test]
    fn test_reencryption_ssn_stable_dob_varies() {
        let transformer = transformer();
        let first = transformer.apply_encryption(&grace(), &people_table()).unwrap();
        let second = transformer.apply_encryption(&grace(), &people_table()).unwrap();

        assert_eq!(first.get("ssn"), second.get("ssn"));
        assert_ne!(first.get("dob"), second.get("dob"));
        assert_eq!(first.get("firstName"), Some(&Value::from("Grace")));
        assert_eq!(second.get("firstName"), Some(&Value::from("Grace")));
    }

    #[test]
    fn test_sub_millisecond_date_round_trip() {
        let transformer = transformer();
        let dob = DateTime::from_timestamp(629_510_400, 123_456_789).unwrap();
        let doc = Document::new().with("dob", Value::Date(DateMillis::new(dob))).with("firstName", "Grace");

        let encrypted = transformer.apply_encryption(&doc, &people_table()).unwrap();
        assert_eq!(transformer.apply_decryption(&encrypted).unwrap(), doc);
    }

    #[test]
    fn test_distinct_millis_distinct_ciphertext() {
        let transformer = transformer();
        let table = PolicyTable::define([FieldPolicy::new(
            "seen",
            BsonType::Date,
            Algorithm::Deterministic,
            "fieldKey1",
        )])
        .unwrap();
        let at = |nanos| Document::new().with("seen", DateTime::from_timestamp(1_000, nanos).unwrap());

        let a = transformer.apply_encryption(&at(1_000_000), &table).unwrap();
        let b = transformer.apply_encryption(&at(2_000_000), &table).unwrap();
        let a_again = transformer.apply_encryption(&at(1_000_001), &table).unwrap();
        assert_ne!(a.get("seen"), b.get("seen"));
        assert_eq!(a.get("seen"), a_again.get("seen"));
    }

    #[test]
    fn test_dotted_field_name_is_not_a_path() {
        let transformer = transformer();
        let doc = Document::new()
            .with("contact.email", "literal@example.com")
            .with("contact", Document::new().with("email", "grace@example.com"));

        let encrypted = transformer.apply_encryption(&doc, &people_table()).unwrap();
        assert_eq!(encrypted.get("contact.email"), Some(&Value::from("literal@example.com")));
        assert!(encrypted.get_path("contact.email").unwrap().as_encrypted().is_some());
        assert_eq!(transformer.apply_decryption(&encrypted).unwrap(), doc);
    }

    #[test]
    fn test_failure_aborts_whole_document() {
        let transformer = transformer();
        let doc = grace().with("dob", "1989-12-13");

        let result = transformer.apply_encryption(&doc, &people_table());
        assert!(matches!(result, Err(Error::TypeMismatch { path, .. }) if path == "dob"));
    }

    #[test]
    fn test_arrays_are_leaves() {
        let transformer = transformer();
        let table = PolicyTable::define([FieldPolicy::new(
            "phones.number",
            BsonType::String,
            Algorithm::Deterministic,
            "fieldKey1",
        )])
        .unwrap();
        let doc = Document::new().with("phones", vec![Value::from(Document::new().with("number", "555"))]);

        let encrypted = transformer.apply_encryption(&doc, &table).unwrap();
        assert_eq!(encrypted, doc);
    }

    #[test]
    fn test_decrypts_inside_arrays() {
        let transformer = transformer();
        let ssn = FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "fieldKey1");
        let ct = transformer.gateway().encrypt_field(&ssn, &Value::from("901-01-0003")).unwrap();

        let doc = Document::new().with("history", vec![Value::from(ct), Value::from(7)]);
        let decrypted = transformer.apply_decryption(&doc).unwrap();

        assert_eq!(decrypted.get("history"), Some(&Value::from(vec![Value::from("901-01-0003"), Value::from(7)])));
    }

    #[test]
    fn test_bypass_passes_through() {
        let transformer = transformer().with_mode(TransformMode::Bypass);
        let encrypted = transformer.apply_encryption(&grace(), &people_table()).unwrap();
        assert_eq!(encrypted, grace());

        let automatic = transformer.with_mode(TransformMode::Automatic);
        let stored = automatic.apply_encryption(&grace(), &people_table()).unwrap();
        assert_eq!(transformer.apply_decryption(&stored).unwrap(), stored);
    }

    #[test]
    fn test_filter_matches_stored_ciphertext() {
        let transformer = transformer();
        let table = people_table();
        let stored = transformer.apply_encryption(&grace(), &table).unwrap();

        let filter = transformer.encrypt_filter(&Document::new().with("ssn", "901-01-0001"), &table).unwrap();
        assert_eq!(filter.get("ssn"), stored.get("ssn"));

        let dotted =
            transformer.encrypt_filter(&Document::new().with("contact.email", "grace@example.com"), &table).unwrap();
        assert_eq!(dotted.get("contact.email"), stored.get_path("contact.email"));
    }

    #[test]
    fn test_filter_on_randomized_field() {
        let transformer = transformer();
        let filter = Document::new().with("dob", Value::date_ymd(1989, 12, 13).unwrap());

        let result = transformer.encrypt_filter(&filter, &people_table());
        assert!(matches!(result, Err(Error::UnqueryableField(path)) if path == "dob"));
    }
}
