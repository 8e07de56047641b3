//! Document store seam and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tracing::{debug, info};

use crate::config::MEMORY_SCHEME;
use crate::error::Error;
use crate::schema::SchemaNode;
use crate::value::Document;

/// Persistence for (already transformed) documents.
///
/// The store never sees plaintext of encrypted fields; it only stores and
/// compares what the client hands it.
pub trait DocumentStore: Send + Sync {
    /// Inserts a document into a namespace (`db.collection`).
    ///
    /// # Errors
    ///
    /// Returns `Error::ValidationFailed` if the namespace validator rejects
    /// the document.
    fn insert(&self, namespace: &str, doc: Document) -> Result<(), Error>;

    /// Returns the documents whose fields equal every filter entry, in
    /// insertion order. Filter keys may be dotted paths.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn find(&self, namespace: &str, filter: &Document) -> Result<Vec<Document>, Error>;

    /// Installs the validator documents must pass on insert.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be written.
    fn set_validator(&self, namespace: &str, validator: SchemaNode) -> Result<(), Error>;

    /// Removes a namespace with its documents and validator.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be written.
    fn drop_namespace(&self, namespace: &str) -> Result<(), Error>;
}

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    validator: Option<SchemaNode>,
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::BackendUnavailable("document store lock poisoned".to_string())
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| doc.get_path(path) == Some(expected))
}

impl DocumentStore for MemoryStore {
    fn insert(&self, namespace: &str, doc: Document) -> Result<(), Error> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let collection = collections.entry(namespace.to_string()).or_default();

        if let Some(validator) = &collection.validator {
            validator.validate(&doc)?;
        }
        collection.documents.push(doc);
        debug!(namespace, count = collection.documents.len(), "document stored");
        Ok(())
    }

    fn find(&self, namespace: &str, filter: &Document) -> Result<Vec<Document>, Error> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections
            .get(namespace)
            .map(|c| c.documents.iter().filter(|doc| matches(doc, filter)).cloned().collect())
            .unwrap_or_default())
    }

    fn set_validator(&self, namespace: &str, validator: SchemaNode) -> Result<(), Error> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(namespace.to_string()).or_default().validator = Some(validator);
        Ok(())
    }

    fn drop_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.collections.write().map_err(poisoned)?.remove(namespace);
        Ok(())
    }
}

static NAMED_STORES: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();

/// Opens the store a connection target names.
///
/// `memory://<name>` is the process-wide in-memory store called `<name>`:
/// every connection to the same target sees the same documents.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` for any other scheme.
pub fn connect(target: &str) -> Result<Arc<dyn DocumentStore>, Error> {
    let name = target
        .strip_prefix(MEMORY_SCHEME)
        .ok_or_else(|| Error::InvalidConfig(format!("unsupported connection target `{target}`")))?;

    let mut stores = NAMED_STORES.get_or_init(Mutex::default).lock().map_err(poisoned)?;
    let store: Arc<dyn DocumentStore> = stores
        .entry(name.to_string())
        .or_insert_with(|| {
            info!(connection = target, "in-memory store created");
            Arc::new(MemoryStore::new())
        })
        .clone();
    drop(stores);
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Algorithm, FieldPolicy, PolicyTable};
    use crate::value::{BsonType, Value};

    fn people() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert("demoFLE.people", Document::new().with("name", "Grace").with("zip", "90210")).unwrap();
        store
            .insert(
                "demoFLE.people",
                Document::new().with("name", "Alan").with("address", Document::new().with("zip", "90210")),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_find_all_and_by_equality() {
        let store = people();

        assert_eq!(store.find("demoFLE.people", &Document::new()).unwrap().len(), 2);

        let found = store.find("demoFLE.people", &Document::new().with("name", "Alan")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("name"), Some(&Value::from("Alan")));

        let dotted = store.find("demoFLE.people", &Document::new().with("address.zip", "90210")).unwrap();
        assert_eq!(dotted.len(), 1);

        assert!(store.find("demoFLE.other", &Document::new()).unwrap().is_empty());
    }

    #[test]
    fn test_validator_rejects_plaintext() {
        let store = MemoryStore::new();
        let table =
            PolicyTable::define([FieldPolicy::new("ssn", BsonType::String, Algorithm::Deterministic, "k")]).unwrap();
        store.set_validator("demoFLE.people", SchemaNode::validator_for(&table)).unwrap();

        let result = store.insert("demoFLE.people", Document::new().with("ssn", "901-01-0001"));
        assert!(matches!(result, Err(Error::ValidationFailed(_))));
        assert!(store.find("demoFLE.people", &Document::new()).unwrap().is_empty());

        store.insert("demoFLE.people", Document::new().with("ssn", Value::Binary(vec![0; 4]))).unwrap();
    }

    #[test]
    fn test_connect_shares_named_stores() {
        let a = connect("memory://store-tests-shared").unwrap();
        let b = connect("memory://store-tests-shared").unwrap();
        let other = connect("memory://store-tests-other").unwrap();

        a.insert("demoFLE.people", Document::new().with("name", "Grace")).unwrap();
        assert_eq!(b.find("demoFLE.people", &Document::new()).unwrap().len(), 1);
        assert!(other.find("demoFLE.people", &Document::new()).unwrap().is_empty());
    }

    #[test]
    fn test_connect_rejects_other_schemes() {
        assert!(matches!(connect("mongodb://localhost:27017"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_drop_namespace() {
        let store = people();
        store.drop_namespace("demoFLE.people").unwrap();
        assert!(store.find("demoFLE.people", &Document::new()).unwrap().is_empty());
    }
}
