//! Data-encryption-key identifiers, vault documents, and the key manager.
//!
//! A data key is 96 bytes of random material, stored in the key vault
//! wrapped under the active provider's master key and referenced everywhere
//! else by its [`DataKeyId`].

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, StorageError};
use crate::keyvault::KeyVault;
use crate::provider::{MasterKeyProvider, DATA_KEY_MATERIAL_SIZE};
use crate::store::Document;

/// Opaque handle referencing a data key in the key vault.
///
/// The canonical text form is the base64 encoding of the 16 raw bytes,
/// suitable for pasting into configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataKeyId([u8; 16]);

impl DataKeyId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Decodes a previously-serialized identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` on malformed base64 or wrong length. Performs
    /// no I/O.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Format(format!("invalid base64: {e}")))?;
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| {
                Error::Format(format!("data key id must be 16 bytes, got {}", b.len()))
            })?;
        Ok(Self(raw))
    }

    /// Returns the base64 text form.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub(crate) const fn from_bytes(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DataKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl Serialize for DataKeyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for DataKeyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A data key as stored in the key vault.
///
/// The key material is wrapped under the recorded provider's master key;
/// the document never holds plaintext material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataKeyDocument {
    /// Data key identifier.
    #[serde(rename = "_id")]
    pub id: DataKeyId,
    /// Key material, wrapped by the provider.
    #[serde(with = "base64_bytes")]
    pub key_material: Vec<u8>,
    /// Name of the provider that wrapped the material.
    pub provider: String,
    /// Application identity marker used for lookup.
    pub alt_name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl DataKeyDocument {
    /// Creates a new data key document stamped with the current time.
    #[must_use]
    pub fn new(
        id: DataKeyId,
        key_material: Vec<u8>,
        provider: impl Into<String>,
        alt_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            key_material,
            provider: provider.into(),
            alt_name: alt_name.into(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn to_document(&self) -> Result<Document, StorageError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(StorageError::Serialization("data key is not an object".into())),
            Err(e) => Err(StorageError::Serialization(e.to_string())),
        }
    }

    pub(crate) fn from_document(doc: Document) -> Result<Self, StorageError> {
        serde_json::from_value(serde_json::Value::Object(doc))
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// Generates fresh plaintext data-key material.
pub(crate) fn generate_key_material() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut material = vec![0u8; DATA_KEY_MATERIAL_SIZE];
    OsRng.fill_bytes(&mut material);
    SecretVec::new(material)
}

/// Finds or creates the application's data key in a key vault.
///
/// The manager is scoped to one provider configuration and one application
/// identity marker; repeated calls against an unmodified vault return the
/// same identifier.
pub struct DataKeyManager {
    vault: KeyVault,
    provider: Arc<dyn MasterKeyProvider>,
    alt_name: String,
}

impl DataKeyManager {
    /// Creates a manager over `vault` using `provider` for wrapping.
    ///
    /// `alt_name` is the application identity marker searched for (and
    /// recorded on) the data key.
    #[must_use]
    pub fn new(
        vault: KeyVault,
        provider: Arc<dyn MasterKeyProvider>,
        alt_name: impl Into<String>,
    ) -> Self {
        Self { vault, provider, alt_name: alt_name.into() }
    }

    /// Returns the key vault this manager operates on.
    #[must_use]
    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    /// Returns the identifier of this application's data key, creating and
    /// persisting one if the vault holds none for the active provider.
    ///
    /// Two concurrent first calls against an empty vault race; the loser
    /// surfaces the vault's unique-index conflict as
    /// `Error::Storage(StorageError::DuplicateKey)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` if the master key is invalid or the
    /// provider is unreachable, `Error::Storage` if the vault is.
    pub fn find_or_create_data_key(&self) -> Result<DataKeyId, Error> {
        if let Some(existing) =
            self.vault.find_by_alt_name(&self.alt_name, self.provider.name())?
        {
            debug!(key_id = %existing.id, "found existing data key");
            return Ok(existing.id);
        }

        let material = generate_key_material();
        let wrapped = self.provider.wrap_data_key(material.expose_secret())?;
        let id = DataKeyId::generate();
        let document = DataKeyDocument::new(id, wrapped, self.provider.name(), &self.alt_name);
        self.vault.insert(&document)?;

        info!(key_id = %id, provider = self.provider.name(), "created data key");
        Ok(id)
    }
}
