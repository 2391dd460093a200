//! End-to-end field-level encryption demo.
//!
//! Ensures a local master key and a data key exist, builds the
//! automatic-encryption schema for patient records, upserts a document
//! through the encrypting client, then reads it back through the encrypting
//! client (plaintext) and the plain client (ciphertext at rest).
//!
//! Repeated runs reuse the same master key, data key, and document.

use std::path::Path;
use std::sync::Arc;

use cloakdb::prelude::*;
use cloakdb_key_file::FileMasterKey;
use serde_json::json;

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let key_path = Path::new("./demo-master-key.txt");
    if !key_path.exists() {
        FileMasterKey::init(key_path)?;
        println!("Master key written to {}\n", key_path.display());
    }
    let provider = Arc::new(FileMasterKey::load(key_path)?);

    let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open("./demo-store.json")?);
    let vault = KeyVault::new(store.clone(), Namespace::new("encryption", "__keyVault"))?;

    let manager = DataKeyManager::new(vault.clone(), provider.clone(), "demo-data-key");
    let data_key = manager.find_or_create_data_key()?;
    println!("Data key: {}\n", data_key.to_base64());

    let data_ns = Namespace::new("records", "patients");
    let schema = EncryptionSchema::builder(data_ns.clone(), data_key)
        .deterministic("ssn")
        .randomized("bloodType")
        .randomized("medicalRecords")
        .deterministic("insurance.policyNumber")
        .build();

    let example_document = doc(json!({
        "name": "Jon Doe",
        "ssn": 241014209,
        "bloodType": "AB+",
        "medicalRecords": [
            {"weight": 180, "bloodPressure": "120/80"}
        ],
        "insurance": {"provider": "MaestCare", "policyNumber": 123142},
    }));

    let factory = ClientFactory::new(store, provider, vault);
    let mut encrypted_client = factory.encrypting_client(schema)?;

    // upsert keyed by ssn so repeated runs don't add more documents
    encrypted_client.update_one(
        &data_ns,
        doc(json!({"ssn": 241014209})),
        example_document,
        true,
    )?;

    // equality query on the deterministically-encrypted field; every field
    // comes back readable
    if let Some(found) = encrypted_client.find_one(&data_ns, doc(json!({"ssn": 241014209})))? {
        println!(
            "Document retrieved with the encrypting client:\n{}\n",
            serde_json::to_string_pretty(&found)?
        );
    }
    encrypted_client.close();

    // the plain client returns the stored bytes: governed fields stay
    // ciphertext
    let mut regular_client = factory.plain_client();
    if let Some(raw) = regular_client.find_one(&data_ns, doc(json!({"name": "Jon Doe"})))? {
        println!(
            "Document retrieved with the plain client:\n{}",
            serde_json::to_string_pretty(&raw)?
        );
    }
    regular_client.close();

    Ok(())
}
