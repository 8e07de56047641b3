//! Basic usage example: automatic field-level encryption from a JSON schema map.

use std::sync::Arc;

use csfle::prelude::*;

const SCHEMA: &str = r#"{
    "medical.patients": {
        "bsonType": "object",
        "properties": {
            "ssn": { "encrypt": { "bsonType": "string", "algorithm": "Deterministic", "keyAltName": "patientKey" } },
            "bloodType": { "encrypt": { "bsonType": "string", "algorithm": "Randomized", "keyAltName": "patientKey" } }
        }
    }
}"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("csfle Basic Usage Example");
    println!("=========================\n");

    let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key())?);
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let config = ClientConfig::new("medical.__keyVault".parse()?);
    let client = EncryptedClient::new(config, kms, Arc::new(MemoryKeyVault::new()), store.clone())?;

    client.create_key("patientKey", MasterKey::Local)?;
    println!("✓ Data key created (alias patientKey)");

    let client = client.with_config(client.config().clone().with_schema_map(SchemaMap::from_json(SCHEMA)?))?;
    println!("✓ Schema loaded for medical.patients\n");

    let patient = Document::new().with("name", "Jon Doe").with("ssn", "241-01-4567").with("bloodType", "AB+");
    client.insert_one("medical.patients", &patient)?;

    println!("Stored document:");
    for doc in store.find("medical.patients", &Document::new())? {
        println!("{doc}");
    }

    println!("\nDecrypted by ssn lookup:");
    for doc in client.find("medical.patients", &Document::new().with("ssn", "241-01-4567"))? {
        println!("{doc}");
    }

    Ok(())
}
