//! # `CloakDB`
//!
//! Client-side field-level encryption for document databases: selected
//! fields are encrypted before they leave the process and decrypted
//! transparently on read, so the stored data never holds plaintext for
//! them.
//!
//! ## Features
//!
//! - Data keys wrapped under a master key (local file or cloud KMS) and
//!   stored in a key vault collection
//! - Automatic-encryption schemas mapping field paths to algorithms
//! - Deterministic encryption (AES-SIV) for equality-queryable fields
//! - Randomized AEAD encryption (ChaCha20-Poly1305) for everything else
//! - One client type, with or without the auto-encryption capability
//!
//! ## Example
//!
//! ```rust,ignore
//! use cloakdb::prelude::*;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
//! let provider = Arc::new(FileMasterKey::load("master-key.txt")?);
//!
//! let vault = KeyVault::new(store.clone(), Namespace::new("encryption", "__keyVault"))?;
//! let manager = DataKeyManager::new(vault.clone(), provider.clone(), "demo-data-key");
//! let key_id = manager.find_or_create_data_key()?;
//!
//! let schema = EncryptionSchema::builder(Namespace::new("records", "patients"), key_id)
//!     .deterministic("ssn")
//!     .randomized("medicalRecords")
//!     .build();
//!
//! let factory = ClientFactory::new(store, provider, vault);
//! let client = factory.encrypting_client(schema)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
mod codec;
pub mod datakey;
pub mod error;
pub mod filestore;
pub mod keyvault;
pub mod provider;
pub mod schema;
pub mod store;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::client::{Client, ClientFactory};
    pub use crate::datakey::{DataKeyId, DataKeyManager};
    pub use crate::error::{Error, ProviderError, StorageError};
    pub use crate::filestore::FileStore;
    pub use crate::keyvault::KeyVault;
    pub use crate::provider::MasterKeyProvider;
    pub use crate::schema::{Algorithm, EncryptionSchema, SchemaBuilder};
    pub use crate::store::{Document, DocumentStore, MemoryStore, Namespace};
}
