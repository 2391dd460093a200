//! Client handles and the factory producing them.
//!
//! Both client flavors are one type: a `Client` optionally carrying an
//! auto-encryption capability (schema + key vault + provider). With the
//! capability, schema-governed fields are encrypted on the way out and any
//! field ciphertext is decrypted on the way in; without it, the client
//! returns stored bytes verbatim, ciphertext included.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::codec::{self, DekMaterial};
use crate::datakey::DataKeyId;
use crate::error::Error;
use crate::keyvault::KeyVault;
use crate::provider::MasterKeyProvider;
use crate::schema::EncryptionSchema;
use crate::store::{path_get, path_set, Document, DocumentStore, Namespace, UpdateResult};

/// Auto-encryption capability of a client handle.
struct AutoEncryption {
    schema: EncryptionSchema,
    vault: KeyVault,
    provider: Arc<dyn MasterKeyProvider>,
    // unwrapped data keys, cached per handle after first use
    dek_cache: RwLock<HashMap<DataKeyId, DekMaterial>>,
}

impl AutoEncryption {
    fn dek(&self, key_id: DataKeyId) -> Result<DekMaterial, Error> {
        if let Some(dek) = self.dek_cache.read().get(&key_id) {
            return Ok(dek.clone());
        }

        let document = self.vault.find_by_id(key_id)?.ok_or_else(|| {
            Error::Decryption(format!(
                "data key {key_id} not found in key vault {}",
                self.vault.namespace()
            ))
        })?;
        if document.provider != self.provider.name() {
            return Err(Error::Decryption(format!(
                "data key {key_id} was created by provider '{}', active provider is '{}'",
                document.provider,
                self.provider.name()
            )));
        }

        let material = self
            .provider
            .unwrap_data_key(&document.key_material)
            .map_err(|e| Error::Decryption(format!("data key {key_id}: {e}")))?;
        let dek = DekMaterial::new(material)?;
        self.dek_cache.write().insert(key_id, dek.clone());
        Ok(dek)
    }

    /// Encrypts the schema-governed fields of an outgoing document in place.
    fn encrypt_document(&self, ns: &Namespace, doc: &mut Document) -> Result<(), Error> {
        if ns != self.schema.namespace() {
            return Ok(());
        }
        for (path, spec) in self.schema.fields() {
            let Some(value) = path_get(doc, path) else { continue };
            if codec::as_carrier(value).is_some() {
                continue;
            }
            let value = value.clone();
            let dek = self.dek(spec.key_id)?;
            let aad = codec::field_aad(ns, path);
            let encrypted = codec::encrypt_value(&dek, spec.key_id, spec.algorithm, &aad, &value)?;
            path_set(doc, path, encrypted);
        }
        Ok(())
    }

    /// Encrypts governed equality-filter values in place.
    ///
    /// Only deterministic fields are queryable; filtering on a randomized
    /// field is a configuration error caught before any store access.
    fn encrypt_filter(&self, ns: &Namespace, filter: &mut Document) -> Result<(), Error> {
        if ns != self.schema.namespace() {
            return Ok(());
        }
        for (path, value) in filter.iter_mut() {
            let Some(spec) = self.schema.field(path.as_str()) else { continue };
            if !spec.algorithm.is_queryable() {
                return Err(Error::EncryptionConfig(format!(
                    "field '{path}' uses the randomized algorithm and cannot be queried by equality"
                )));
            }
            if codec::as_carrier(value).is_some() {
                continue;
            }
            let dek = self.dek(spec.key_id)?;
            let aad = codec::field_aad(ns, path);
            *value = codec::encrypt_value(&dek, spec.key_id, spec.algorithm, &aad, value)?;
        }
        Ok(())
    }

    /// Decrypts every ciphertext carrier in an incoming document in place.
    fn decrypt_document(&self, ns: &Namespace, doc: &mut Document) -> Result<(), Error> {
        self.decrypt_tree(ns, doc, "")
    }

    // Ciphertext is only ever written at object field paths, so the walk
    // descends objects and leaves arrays alone.
    fn decrypt_tree(&self, ns: &Namespace, doc: &mut Document, prefix: &str) -> Result<(), Error> {
        for (key, value) in doc.iter_mut() {
            let path =
                if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
            let carrier = codec::as_carrier(value).map(str::to_owned);
            if let Some(encoded) = carrier {
                let frame = codec::decode_carrier(&encoded)?;
                let dek = self.dek(frame.key_id)?;
                let aad = codec::field_aad(ns, &path);
                *value = codec::decrypt_frame(&dek, &frame, &aad)?;
            } else if let Some(inner) = value.as_object_mut() {
                self.decrypt_tree(ns, inner, &path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Closed,
}

/// A handle onto the underlying database.
///
/// Constructed open; [`close`](Self::close) releases it, after which every
/// operation fails with [`Error::UseAfterClose`]. Handles are independent —
/// closing one never affects another — and are not designed for concurrent
/// use by multiple callers without external synchronization.
pub struct Client {
    store: Arc<dyn DocumentStore>,
    encryption: Option<AutoEncryption>,
    state: HandleState,
}

impl Client {
    fn open(store: Arc<dyn DocumentStore>, encryption: Option<AutoEncryption>) -> Self {
        debug!(encrypting = encryption.is_some(), "client opened");
        Self { store, encryption, state: HandleState::Open }
    }

    /// Whether this handle carries the auto-encryption capability.
    #[must_use]
    pub fn is_encrypting(&self) -> bool {
        self.encryption.is_some()
    }

    /// Whether this handle is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Releases the handle. Idempotent; there is no reopening.
    pub fn close(&mut self) {
        if self.state == HandleState::Open {
            self.state = HandleState::Closed;
            debug!("client closed");
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.state {
            HandleState::Open => Ok(()),
            HandleState::Closed => Err(Error::UseAfterClose),
        }
    }

    /// Inserts a document, encrypting governed fields first when this is an
    /// encrypting handle.
    ///
    /// # Errors
    ///
    /// `Error::UseAfterClose` on a closed handle, `Error::EncryptionConfig`
    /// or `Error::Provider` if field encryption fails (before any store
    /// write), `Error::Storage` from the store.
    pub fn insert_one(&self, ns: &Namespace, mut doc: Document) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(enc) = &self.encryption {
            enc.encrypt_document(ns, &mut doc)?;
        }
        self.store.insert_one(ns, doc)?;
        Ok(())
    }

    /// Returns the first document matching the filter.
    ///
    /// On an encrypting handle, deterministic governed fields in the filter
    /// are encrypted before the lookup and the result is decrypted before it
    /// is returned.
    ///
    /// # Errors
    ///
    /// `Error::UseAfterClose` on a closed handle, `Error::EncryptionConfig`
    /// when filtering on a randomized field, `Error::Decryption` when the
    /// result cannot be decrypted, `Error::Storage` from the store.
    pub fn find_one(
        &self,
        ns: &Namespace,
        mut filter: Document,
    ) -> Result<Option<Document>, Error> {
        self.ensure_open()?;
        if let Some(enc) = &self.encryption {
            enc.encrypt_filter(ns, &mut filter)?;
        }
        let mut found = self.store.find_one(ns, &filter)?;
        if let (Some(enc), Some(doc)) = (&self.encryption, found.as_mut()) {
            enc.decrypt_document(ns, doc)?;
        }
        Ok(found)
    }

    /// Updates the first document matching the filter, optionally inserting
    /// when nothing matches.
    ///
    /// Encryption is applied to both the filter and the replacement fields
    /// before the store is touched, so a failure leaves the store untouched.
    ///
    /// # Errors
    ///
    /// As [`find_one`](Self::find_one), plus `Error::Storage` conflicts from
    /// unique indexes.
    pub fn update_one(
        &self,
        ns: &Namespace,
        mut filter: Document,
        mut set: Document,
        upsert: bool,
    ) -> Result<UpdateResult, Error> {
        self.ensure_open()?;
        if let Some(enc) = &self.encryption {
            enc.encrypt_filter(ns, &mut filter)?;
            enc.encrypt_document(ns, &mut set)?;
        }
        Ok(self.store.update_one(ns, &filter, &set, upsert)?)
    }
}

/// Builds client handles against one store, key vault, and provider
/// configuration.
pub struct ClientFactory {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn MasterKeyProvider>,
    vault: KeyVault,
}

impl ClientFactory {
    /// Creates a factory. The vault must be the same one the application's
    /// data keys were created in.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn MasterKeyProvider>,
        vault: KeyVault,
    ) -> Self {
        Self { store, provider, vault }
    }

    /// Opens an auto-encrypting client governed by `schema`.
    ///
    /// Construction validates the configuration before any write is
    /// possible: every data key the schema references must exist in the
    /// configured key vault and carry the active provider's name.
    ///
    /// # Errors
    ///
    /// `Error::EncryptionConfig` on a missing or foreign data key,
    /// `Error::Storage` if the vault cannot be read.
    pub fn encrypting_client(&self, schema: EncryptionSchema) -> Result<Client, Error> {
        for key_id in schema.key_ids() {
            let document = self.vault.find_by_id(key_id)?.ok_or_else(|| {
                Error::EncryptionConfig(format!(
                    "schema references data key {key_id} not present in key vault {}",
                    self.vault.namespace()
                ))
            })?;
            if document.provider != self.provider.name() {
                return Err(Error::EncryptionConfig(format!(
                    "data key {key_id} was created by provider '{}' but the active provider is '{}'",
                    document.provider,
                    self.provider.name()
                )));
            }
        }

        info!(namespace = %schema.namespace(), "opening auto-encrypting client");
        Ok(Client::open(
            self.store.clone(),
            Some(AutoEncryption {
                schema,
                vault: self.vault.clone(),
                provider: self.provider.clone(),
                dek_cache: RwLock::new(HashMap::new()),
            }),
        ))
    }

    /// Opens a client with no encryption configuration; reads return raw
    /// stored values, ciphertext included.
    #[must_use]
    pub fn plain_client(&self) -> Client {
        Client::open(self.store.clone(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datakey::DataKeyManager;
    use crate::error::ProviderError;
    use crate::store::MemoryStore;
    use secrecy::SecretVec;
    use serde_json::json;

    // Mock provider wrapping with XOR, enough to exercise client plumbing.
    struct MockProvider {
        name: &'static str,
    }

    impl MockProvider {
        fn local() -> Arc<Self> {
            Arc::new(Self { name: "local" })
        }

        fn named(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name })
        }
    }

    impl MasterKeyProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn wrap_data_key(&self, material: &[u8]) -> Result<Vec<u8>, ProviderError> {
            Ok(material.iter().map(|b| b ^ 0x42).collect())
        }

        fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<SecretVec<u8>, ProviderError> {
            Ok(SecretVec::new(wrapped.iter().map(|b| b ^ 0x42).collect()))
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn patient() -> Document {
        doc(json!({
            "name": "Jon Doe",
            "ssn": 241014209,
            "bloodType": "AB+",
            "medicalRecords": [{"weight": 180, "bloodPressure": "120/80"}],
            "insurance": {"provider": "MaestCare", "policyNumber": 123142},
        }))
    }

    struct Fixture {
        factory: ClientFactory,
        schema: EncryptionSchema,
        data_ns: Namespace,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let provider = MockProvider::local();
        let vault =
            KeyVault::new(store.clone(), Namespace::new("encryption", "__keyVault")).unwrap();

        let manager = DataKeyManager::new(vault.clone(), provider.clone(), "demo-data-key");
        let key_id = manager.find_or_create_data_key().unwrap();

        let data_ns = Namespace::new("records", "patients");
        let schema = EncryptionSchema::builder(data_ns.clone(), key_id)
            .deterministic("ssn")
            .randomized("bloodType")
            .randomized("medicalRecords")
            .deterministic("insurance.policyNumber")
            .build();

        Fixture { factory: ClientFactory::new(store, provider, vault), schema, data_ns }
    }

    #[test]
    fn test_round_trip_through_encrypting_client() {
        let fx = fixture();
        let client = fx.factory.encrypting_client(fx.schema).unwrap();

        client.insert_one(&fx.data_ns, patient()).unwrap();

        // equality query on the deterministically-encrypted field
        let found = client
            .find_one(&fx.data_ns, doc(json!({"ssn": 241014209})))
            .unwrap()
            .expect("equality query on deterministic field should match");
        assert_eq!(found, patient());
    }

    #[test]
    fn test_plain_client_sees_ciphertext_at_rest() {
        let fx = fixture();
        let encrypting = fx.factory.encrypting_client(fx.schema).unwrap();
        encrypting.insert_one(&fx.data_ns, patient()).unwrap();

        let plain = fx.factory.plain_client();
        let raw = plain
            .find_one(&fx.data_ns, doc(json!({"name": "Jon Doe"})))
            .unwrap()
            .expect("plain client should find the stored document");

        // governed fields are unreadable ciphertext carriers
        for path in ["ssn", "bloodType", "medicalRecords", "insurance.policyNumber"] {
            let value = path_get(&raw, path).unwrap();
            assert!(
                value.as_object().is_some_and(|o| o.contains_key("$ciphertext")),
                "{path} should be stored encrypted"
            );
            assert_ne!(value, path_get(&patient(), path).unwrap());
        }

        // ungoverned fields pass through unmodified
        assert_eq!(raw.get("name"), Some(&json!("Jon Doe")));
        assert_eq!(path_get(&raw, "insurance.provider"), Some(&json!("MaestCare")));
    }

    #[test]
    fn test_upsert_then_reread() {
        let fx = fixture();
        let client = fx.factory.encrypting_client(fx.schema).unwrap();

        let result = client
            .update_one(&fx.data_ns, doc(json!({"ssn": 241014209})), patient(), true)
            .unwrap();
        assert!(result.upserted);

        // a second upsert of the same document updates in place
        let result = client
            .update_one(&fx.data_ns, doc(json!({"ssn": 241014209})), patient(), true)
            .unwrap();
        assert!(result.matched && !result.upserted);

        let found =
            client.find_one(&fx.data_ns, doc(json!({"ssn": 241014209}))).unwrap().unwrap();
        assert_eq!(found, patient());
    }

    #[test]
    fn test_filter_on_randomized_field_is_rejected() {
        let fx = fixture();
        let client = fx.factory.encrypting_client(fx.schema).unwrap();
        client.insert_one(&fx.data_ns, patient()).unwrap();

        let result = client.find_one(&fx.data_ns, doc(json!({"bloodType": "AB+"})));
        assert!(matches!(result, Err(Error::EncryptionConfig(_))));
    }

    #[test]
    fn test_schema_with_unknown_data_key_is_rejected_at_construction() {
        let fx = fixture();
        let orphan = EncryptionSchema::builder(fx.data_ns.clone(), DataKeyId::generate())
            .deterministic("ssn")
            .build();

        let result = fx.factory.encrypting_client(orphan);
        assert!(matches!(result, Err(Error::EncryptionConfig(_))));
    }

    #[test]
    fn test_provider_mismatch_is_rejected_at_construction() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vault =
            KeyVault::new(store.clone(), Namespace::new("encryption", "__keyVault")).unwrap();

        // key created under "local", factory configured with "aws"
        let manager = DataKeyManager::new(vault.clone(), MockProvider::local(), "demo-data-key");
        let key_id = manager.find_or_create_data_key().unwrap();

        let data_ns = Namespace::new("records", "patients");
        let schema =
            EncryptionSchema::builder(data_ns, key_id).deterministic("ssn").build();

        let factory = ClientFactory::new(store, MockProvider::named("aws"), vault);
        let result = factory.encrypting_client(schema);
        assert!(matches!(result, Err(Error::EncryptionConfig(_))));
    }

    #[test]
    fn test_operations_after_close_fail() {
        let fx = fixture();
        let mut client = fx.factory.encrypting_client(fx.schema).unwrap();
        assert!(client.is_open());

        client.close();
        client.close(); // idempotent
        assert!(!client.is_open());

        let result = client.find_one(&fx.data_ns, doc(json!({"ssn": 241014209})));
        assert!(matches!(result, Err(Error::UseAfterClose)));
        let result = client.insert_one(&fx.data_ns, patient());
        assert!(matches!(result, Err(Error::UseAfterClose)));
    }

    #[test]
    fn test_closing_one_handle_leaves_others_open() {
        let fx = fixture();
        let encrypting = fx.factory.encrypting_client(fx.schema).unwrap();
        let mut plain = fx.factory.plain_client();

        encrypting.insert_one(&fx.data_ns, patient()).unwrap();
        plain.close();

        assert!(encrypting.is_open());
        assert!(encrypting
            .find_one(&fx.data_ns, doc(json!({"ssn": 241014209})))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_ungoverned_namespace_passes_through() {
        let fx = fixture();
        let client = fx.factory.encrypting_client(fx.schema).unwrap();

        let other_ns = Namespace::new("records", "staff");
        client.insert_one(&other_ns, doc(json!({"ssn": 1}))).unwrap();

        // no schema governs records.staff, so the value is stored in the clear
        let raw = fx
            .factory
            .plain_client()
            .find_one(&other_ns, doc(json!({"ssn": 1})))
            .unwrap();
        assert!(raw.is_some());
    }

    #[test]
    fn test_absent_governed_fields_are_skipped() {
        let fx = fixture();
        let client = fx.factory.encrypting_client(fx.schema).unwrap();

        client
            .insert_one(&fx.data_ns, doc(json!({"name": "No Records", "ssn": 7})))
            .unwrap();
        let found = client.find_one(&fx.data_ns, doc(json!({"ssn": 7}))).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("No Records")));
        assert!(!found.contains_key("bloodType"));
    }
}
