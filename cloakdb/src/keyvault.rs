//! Key vault accessor.
//!
//! The key vault is an ordinary collection in the underlying store, set
//! aside for data-key documents. Every component that touches data keys
//! (the manager, the encrypting client) must agree on the exact same vault
//! namespace or lookups silently miss, so the vault exposes its namespace
//! for reuse.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::datakey::{DataKeyDocument, DataKeyId};
use crate::error::Error;
use crate::store::{Document, DocumentStore, Namespace};

/// Field on data-key documents carrying the application identity marker.
const ALT_NAME_FIELD: &str = "altName";

/// Namespaced accessor for data-key documents.
#[derive(Clone)]
pub struct KeyVault {
    store: Arc<dyn DocumentStore>,
    namespace: Namespace,
}

impl KeyVault {
    /// Opens the vault at `namespace`, provisioning the collection and the
    /// unique index on the identity marker. Idempotent.
    ///
    /// The unique index turns a lost race between two concurrent data-key
    /// creations into a `StorageError::DuplicateKey` conflict instead of a
    /// silent duplicate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the store is unavailable or existing
    /// documents already violate the marker constraint.
    pub fn new(store: Arc<dyn DocumentStore>, namespace: Namespace) -> Result<Self, Error> {
        store.ensure_collection(&namespace)?;
        store.ensure_unique_index(&namespace, ALT_NAME_FIELD)?;
        debug!(namespace = %namespace, "key vault ready");
        Ok(Self { store, namespace })
    }

    /// Returns the vault namespace, for reuse when configuring the
    /// encrypting client.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Looks up a data key by identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on store failure.
    pub fn find_by_id(&self, id: DataKeyId) -> Result<Option<DataKeyDocument>, Error> {
        let mut filter = Document::new();
        filter.insert("_id".to_string(), Value::String(id.to_base64()));
        self.find(&filter)
    }

    /// Looks up a data key by identity marker, scoped to a provider name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` on store failure.
    pub fn find_by_alt_name(
        &self,
        alt_name: &str,
        provider: &str,
    ) -> Result<Option<DataKeyDocument>, Error> {
        let mut filter = Document::new();
        filter.insert(ALT_NAME_FIELD.to_string(), Value::String(alt_name.to_string()));
        filter.insert("provider".to_string(), Value::String(provider.to_string()));
        self.find(&filter)
    }

    /// Persists a data-key document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage`; a marker collision is
    /// `StorageError::DuplicateKey`.
    pub fn insert(&self, key: &DataKeyDocument) -> Result<(), Error> {
        let doc = key.to_document()?;
        self.store.insert_one(&self.namespace, doc)?;
        Ok(())
    }

    fn find(&self, filter: &Document) -> Result<Option<DataKeyDocument>, Error> {
        match self.store.find_one(&self.namespace, filter)? {
            Some(doc) => Ok(Some(DataKeyDocument::from_document(doc)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::store::MemoryStore;

    fn vault_ns() -> Namespace {
        Namespace::new("encryption", "__keyVault")
    }

    fn sample_key(alt_name: &str, provider: &str) -> DataKeyDocument {
        DataKeyDocument::new(DataKeyId::generate(), vec![7; 32], provider, alt_name)
    }

    #[test]
    fn test_new_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let first = KeyVault::new(store.clone(), vault_ns()).unwrap();
        first.insert(&sample_key("demo-data-key", "local")).unwrap();

        // re-opening over a populated vault must not fail or wipe anything
        let second = KeyVault::new(store, vault_ns()).unwrap();
        let found = second.find_by_alt_name("demo-data-key", "local").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_insert_and_find_by_id() {
        let vault = KeyVault::new(Arc::new(MemoryStore::new()), vault_ns()).unwrap();
        let key = sample_key("demo-data-key", "local");
        vault.insert(&key).unwrap();

        let found = vault.find_by_id(key.id).unwrap().expect("inserted key should be found");
        assert_eq!(found, key);

        assert!(vault.find_by_id(DataKeyId::generate()).unwrap().is_none());
    }

    #[test]
    fn test_find_by_alt_name_is_provider_scoped() {
        let vault = KeyVault::new(Arc::new(MemoryStore::new()), vault_ns()).unwrap();
        vault.insert(&sample_key("demo-data-key", "local")).unwrap();

        assert!(vault.find_by_alt_name("demo-data-key", "local").unwrap().is_some());
        assert!(vault.find_by_alt_name("demo-data-key", "aws").unwrap().is_none());
        assert!(vault.find_by_alt_name("other", "local").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_marker_is_a_conflict() {
        let vault = KeyVault::new(Arc::new(MemoryStore::new()), vault_ns()).unwrap();
        vault.insert(&sample_key("demo-data-key", "local")).unwrap();

        let result = vault.insert(&sample_key("demo-data-key", "local"));
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::DuplicateKey { .. }))
        ));
    }

    #[test]
    fn test_vault_namespace_exposed_for_clients() {
        let vault = KeyVault::new(Arc::new(MemoryStore::new()), vault_ns()).unwrap();
        assert_eq!(vault.namespace().full_name(), "encryption.__keyVault");
    }
}
