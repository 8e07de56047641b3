//! Serialized schema declarations.
//!
//! A schema map is keyed by `"db.collection"`. Each collection schema is a
//! tree mirroring the document shape; encrypted leaves carry an `encrypt`
//! block:
//!
//! ```json
//! {
//!   "demoFLE.people": {
//!     "bsonType": "object",
//!     "properties": {
//!       "ssn": { "encrypt": { "bsonType": "string", "algorithm": "Deterministic", "keyAltName": "fieldKey1" } },
//!       "contact": {
//!         "bsonType": "object",
//!         "properties": {
//!           "email": { "encrypt": { "bsonType": "string", "algorithm": "Deterministic", "keyAltName": "fieldKey2" } }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! The same tree without `encrypt` blocks doubles as a store-side validator:
//! every property with a `bsonType` must have that type when present.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::{Algorithm, FieldPolicy, PolicyTable};
use crate::value::{BsonType, Document};

/// Encryption block of an encrypted leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptSpec {
    /// Declared plaintext type
    pub bson_type: BsonType,
    /// Encryption algorithm
    pub algorithm: Algorithm,
    /// Alias of the data key
    pub key_alt_name: String,
}

/// One node of a collection schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SchemaNode {
    /// Expected type of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bson_type: Option<BsonType>,
    /// Child nodes of an object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,
    /// Encryption block, for encrypted leaves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<EncryptSpec>,
}

impl SchemaNode {
    fn object() -> Self {
        Self { bson_type: Some(BsonType::Object), ..Self::default() }
    }

    /// Builds the collection schema for a policy table.
    #[must_use]
    pub fn from_table(table: &PolicyTable) -> Self {
        Self::build(table, |policy| Self {
            encrypt: Some(EncryptSpec {
                bson_type: policy.bson_type(),
                algorithm: policy.algorithm(),
                key_alt_name: policy.key_alias().to_string(),
            }),
            ..Self::default()
        })
    }

    /// Builds the validator a document store should enforce for a policy
    /// table: every encrypted path must hold binary data.
    #[must_use]
    pub fn validator_for(table: &PolicyTable) -> Self {
        Self::build(table, |_| Self { bson_type: Some(BsonType::BinData), ..Self::default() })
    }

    fn build(table: &PolicyTable, leaf: impl Fn(&FieldPolicy) -> Self) -> Self {
        let mut root = Self::object();
        for policy in table.iter() {
            let mut segments: Vec<&str> = policy.path().split('.').collect();
            let last = segments.pop().unwrap_or_default();

            let mut node = &mut root;
            for segment in segments {
                node = node.properties.entry(segment.to_string()).or_insert_with(Self::object);
            }
            node.properties.insert(last.to_string(), leaf(policy));
        }
        root
    }

    /// Flattens the schema into a policy table.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if a node is both encrypted and an
    /// object with properties, and whatever `PolicyTable::define` rejects.
    pub fn to_table(&self) -> Result<PolicyTable, Error> {
        let mut policies = Vec::new();
        self.collect("", &mut policies)?;
        PolicyTable::define(policies)
    }

    fn collect(&self, prefix: &str, out: &mut Vec<FieldPolicy>) -> Result<(), Error> {
        if let Some(spec) = &self.encrypt {
            if prefix.is_empty() {
                return Err(Error::InvalidSchema("the document root cannot be encrypted".to_string()));
            }
            if !self.properties.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "`{prefix}` is encrypted and also declares properties"
                )));
            }
            out.push(FieldPolicy::new(prefix, spec.bson_type, spec.algorithm, spec.key_alt_name.clone()));
            return Ok(());
        }

        for (name, child) in &self.properties {
            let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
            child.collect(&path, out)?;
        }
        Ok(())
    }

    /// Checks a document against the node's declared types.
    ///
    /// Missing fields pass. Encrypted leaves require binary data.
    ///
    /// # Errors
    ///
    /// Returns `Error::ValidationFailed` naming the first offending path.
    pub fn validate(&self, doc: &Document) -> Result<(), Error> {
        self.validate_fields("", doc)
    }

    fn validate_fields(&self, prefix: &str, doc: &Document) -> Result<(), Error> {
        for (name, node) in &self.properties {
            let Some(value) = doc.get(name) else { continue };
            let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };

            let expected = if node.encrypt.is_some() { Some(BsonType::BinData) } else { node.bson_type };
            if let Some(expected) = expected {
                if value.bson_type() != expected {
                    return Err(Error::ValidationFailed(format!(
                        "`{path}` must be {expected}, found {}",
                        value.bson_type()
                    )));
                }
            }

            if let Some(child) = value.as_document() {
                node.validate_fields(&path, child)?;
            }
        }
        Ok(())
    }
}

/// Collection schemas keyed by `"db.collection"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    collections: BTreeMap<String, SchemaNode>,
}

impl SchemaMap {
    /// Creates an empty schema map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the schema for a namespace, builder style.
    #[must_use]
    pub fn with_table(mut self, namespace: impl Into<String>, table: &PolicyTable) -> Self {
        self.collections.insert(namespace.into(), SchemaNode::from_table(table));
        self
    }

    /// Parses a JSON schema map.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSchema(e.to_string()))
    }

    /// Renders the schema map as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSchema(e.to_string()))
    }

    /// Returns the raw schema for a namespace.
    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<&SchemaNode> {
        self.collections.get(namespace)
    }

    /// Returns the policy table for a namespace. Unlisted namespaces get an
    /// empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace's schema is invalid.
    pub fn policy_table(&self, namespace: &str) -> Result<PolicyTable, Error> {
        self.get(namespace).map_or_else(|| Ok(PolicyTable::default()), SchemaNode::to_table)
    }

    /// Iterates namespaces.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }
}
