//! Example comparing deterministic and randomized explicit encryption
//!
//! Deterministic ciphertexts can be matched by equality; randomized ones
//! never repeat.

use std::sync::Arc;

use csfle::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("csfle Deterministic Encryption Example");
    println!("======================================\n");

    let kms = KmsProviders::new().with(LocalKms::new(LocalKms::generate_master_key())?);
    let config = ClientConfig::new("demoFLE.__keystore".parse()?);
    let client = EncryptedClient::new(config, kms, Arc::new(MemoryKeyVault::new()), Arc::new(MemoryStore::new()))?;
    let key = client.create_key("emailKey", MasterKey::Local)?;
    println!("✓ Data key {} created (alias emailKey)\n", key.id());

    let email = Value::from("alice@example.com");
    let by_alias = KeyRef::from("emailKey");

    // Example 1: Deterministic property
    println!("Example 1: Deterministic Encryption");
    println!("-----------------------------------");
    let ct1 = client.encrypt(&by_alias, &email, Algorithm::Deterministic)?;
    let ct2 = client.encrypt(&KeyRef::Id(key.id()), &email, Algorithm::Deterministic)?;
    println!("Ciphertext 1: {} bytes", ct1.as_bytes().len());
    println!("Ciphertext 2: {} bytes", ct2.as_bytes().len());
    println!("Deterministic: {}", if ct1 == ct2 { "✓ YES" } else { "✗ NO" });
    println!("→ Same key + type + plaintext produces identical ciphertext\n");

    // Example 2: Equality matching on ciphertext
    println!("Example 2: Equality Matching");
    println!("----------------------------");
    let stored = ["alice@example.com", "bob@example.com", "alice@example.com"]
        .into_iter()
        .map(|e| client.encrypt(&by_alias, &Value::from(e), Algorithm::Deterministic))
        .collect::<Result<Vec<_>, _>>()?;
    let needle = client.encrypt(&by_alias, &email, Algorithm::Deterministic)?;
    let hits: Vec<_> = stored.iter().enumerate().filter(|(_, ct)| **ct == needle).map(|(i, _)| i).collect();
    println!("Found {} match(es) at indices: {hits:?}", hits.len());
    println!("→ Equality queries work on encrypted data!\n");

    // Example 3: Randomized encryption
    println!("Example 3: Randomized Encryption");
    println!("--------------------------------");
    let r1 = client.encrypt(&by_alias, &email, Algorithm::Randomized)?;
    let r2 = client.encrypt(&by_alias, &email, Algorithm::Randomized)?;
    println!("Identical: {}", if r1 == r2 { "✗ YES" } else { "✓ NO" });
    println!("Decrypts to: {:?}\n", client.decrypt(&r1)?);

    // Example 4: Types without a stable encoding
    println!("Example 4: Unsupported Deterministic Types");
    println!("------------------------------------------");
    match client.encrypt(&by_alias, &Value::Double(98.6), Algorithm::Deterministic) {
        Ok(_) => println!("✗ double encrypted deterministically"),
        Err(err) => println!("✓ rejected: {err}"),
    }

    Ok(())
}
