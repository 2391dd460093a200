//! Automatic-encryption schema.
//!
//! A schema maps one collection namespace to the set of field paths the
//! client must encrypt, each with an algorithm and the data key to use.
//! Schemas are pure data: building one performs no I/O, and the same inputs
//! always produce the identical schema.
//!
//! Fields queried by equality elsewhere in the application must use the
//! deterministic algorithm; everything else should stay randomized for
//! maximum confidentiality. Deterministic fields must keep the same key and
//! algorithm across writes, or equality queries silently stop matching old
//! ciphertext.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Map, Value};

use crate::datakey::DataKeyId;
use crate::store::Namespace;

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Same plaintext and field always produce the same ciphertext;
    /// equality-queryable.
    Deterministic,
    /// Fresh nonce per write; never queryable.
    Randomized,
}

impl Algorithm {
    /// Returns the stable tag used in rendered schemas.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Randomized => "randomized",
        }
    }

    /// Whether equality filters on a field with this algorithm are allowed.
    #[must_use]
    pub const fn is_queryable(self) -> bool {
        matches!(self, Self::Deterministic)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption properties of a single governed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Algorithm applied to the field value.
    pub algorithm: Algorithm,
    /// Data key encrypting the field.
    pub key_id: DataKeyId,
}

/// Static mapping from one collection namespace to its encrypted fields.
///
/// Field paths are dotted (`"insurance.policyNumber"`). A path nested under
/// another governed path is unsupported: encrypting a value always covers
/// everything beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSchema {
    namespace: Namespace,
    fields: BTreeMap<String, FieldSpec>,
}

impl EncryptionSchema {
    /// Starts a builder for `namespace` with `key_id` as the key for every
    /// registered field.
    #[must_use]
    pub fn builder(namespace: Namespace, key_id: DataKeyId) -> SchemaBuilder {
        SchemaBuilder { namespace, key_id, fields: BTreeMap::new() }
    }

    /// Returns the governed namespace.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the encryption properties for a field path, if governed.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.get(path)
    }

    /// Iterates over governed field paths in lexicographic order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(path, spec)| (path.as_str(), spec))
    }

    /// Returns the distinct data keys the schema references.
    #[must_use]
    pub fn key_ids(&self) -> BTreeSet<DataKeyId> {
        self.fields.values().map(|spec| spec.key_id).collect()
    }

    /// Whether the schema governs no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the driver-facing JSON form, keyed by the full namespace.
    ///
    /// When every field shares one key the key reference is hoisted into
    /// `encryptMetadata`; otherwise each field carries its own `keyId`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let shared_key = match self.key_ids().len() {
            1 => self.fields.values().next().map(|spec| spec.key_id),
            _ => None,
        };

        let grouped: Vec<(&str, &FieldSpec)> = self.fields().collect();
        let properties = render_properties(&grouped, shared_key);

        let mut body = Map::new();
        if let Some(key_id) = shared_key {
            let mut metadata = Map::new();
            metadata.insert("keyId".to_string(), Value::String(key_id.to_base64()));
            body.insert("encryptMetadata".to_string(), Value::Object(metadata));
        }
        body.insert("properties".to_string(), properties);

        let mut root = Map::new();
        root.insert(self.namespace.full_name(), Value::Object(body));
        Value::Object(root)
    }
}

fn render_properties(fields: &[(&str, &FieldSpec)], shared_key: Option<DataKeyId>) -> Value {
    let mut properties = Map::new();
    let mut nested: BTreeMap<&str, Vec<(&str, &FieldSpec)>> = BTreeMap::new();

    for &(path, spec) in fields {
        match path.split_once('.') {
            None => {
                let mut encrypt = Map::new();
                encrypt.insert(
                    "algorithm".to_string(),
                    Value::String(spec.algorithm.as_str().to_string()),
                );
                if shared_key.is_none() {
                    encrypt.insert("keyId".to_string(), Value::String(spec.key_id.to_base64()));
                }
                let mut leaf = Map::new();
                leaf.insert("encrypt".to_string(), Value::Object(encrypt));
                properties.insert(path.to_string(), Value::Object(leaf));
            }
            Some((head, rest)) => {
                nested.entry(head).or_default().push((rest, spec));
            }
        }
    }

    for (head, children) in nested {
        let mut inner = Map::new();
        inner.insert("properties".to_string(), render_properties(&children, shared_key));
        properties.insert(head.to_string(), Value::Object(inner));
    }

    Value::Object(properties)
}

/// Builder for [`EncryptionSchema`].
///
/// # Example
///
/// ```
/// use cloakdb::datakey::DataKeyId;
/// use cloakdb::schema::EncryptionSchema;
/// use cloakdb::store::Namespace;
///
/// let key_id = DataKeyId::generate();
/// let schema = EncryptionSchema::builder(Namespace::new("records", "patients"), key_id)
///     .deterministic("ssn")
///     .randomized("medicalRecords")
///     .build();
/// assert!(schema.field("ssn").is_some());
/// ```
pub struct SchemaBuilder {
    namespace: Namespace,
    key_id: DataKeyId,
    fields: BTreeMap<String, Algorithm>,
}

impl SchemaBuilder {
    /// Registers a field for deterministic (equality-queryable) encryption.
    #[must_use]
    pub fn deterministic(mut self, path: impl Into<String>) -> Self {
        self.fields.insert(path.into(), Algorithm::Deterministic);
        self
    }

    /// Registers a field for randomized encryption.
    #[must_use]
    pub fn randomized(mut self, path: impl Into<String>) -> Self {
        self.fields.insert(path.into(), Algorithm::Randomized);
        self
    }

    /// Finishes the schema.
    #[must_use]
    pub fn build(self) -> EncryptionSchema {
        let key_id = self.key_id;
        let fields = self
            .fields
            .into_iter()
            .map(|(path, algorithm)| (path, FieldSpec { algorithm, key_id }))
            .collect();
        EncryptionSchema { namespace: self.namespace, fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patients_schema(key_id: DataKeyId) -> EncryptionSchema {
        EncryptionSchema::builder(Namespace::new("records", "patients"), key_id)
            .deterministic("ssn")
            .randomized("bloodType")
            .randomized("medicalRecords")
            .deterministic("insurance.policyNumber")
            .build()
    }

    #[test]
    fn test_schema_is_a_pure_function_of_inputs() {
        let key_id = DataKeyId::generate();
        assert_eq!(patients_schema(key_id), patients_schema(key_id));
        assert_eq!(patients_schema(key_id).to_json(), patients_schema(key_id).to_json());
    }

    #[test]
    fn test_field_lookup() {
        let schema = patients_schema(DataKeyId::generate());

        let ssn = schema.field("ssn").unwrap();
        assert_eq!(ssn.algorithm, Algorithm::Deterministic);
        assert!(ssn.algorithm.is_queryable());

        let records = schema.field("medicalRecords").unwrap();
        assert_eq!(records.algorithm, Algorithm::Randomized);
        assert!(!records.algorithm.is_queryable());

        assert!(schema.field("name").is_none());
    }

    #[test]
    fn test_single_key_is_hoisted_into_metadata() {
        let key_id = DataKeyId::generate();
        let rendered = patients_schema(key_id).to_json();

        let body = &rendered["records.patients"];
        assert_eq!(
            body["encryptMetadata"]["keyId"],
            serde_json::Value::String(key_id.to_base64())
        );
        assert_eq!(body["properties"]["ssn"]["encrypt"]["algorithm"], "deterministic");
        // field-level keyId is omitted when hoisted
        assert!(body["properties"]["ssn"]["encrypt"].get("keyId").is_none());
    }

    #[test]
    fn test_nested_paths_render_as_nested_properties() {
        let rendered = patients_schema(DataKeyId::generate()).to_json();
        let encrypt =
            &rendered["records.patients"]["properties"]["insurance"]["properties"]["policyNumber"]
                ["encrypt"];
        assert_eq!(encrypt["algorithm"], "deterministic");
    }

    #[test]
    fn test_key_ids_are_deduplicated() {
        let key_id = DataKeyId::generate();
        let schema = patients_schema(key_id);
        let ids = schema.key_ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&key_id));
    }

    #[test]
    fn test_empty_schema() {
        let schema =
            EncryptionSchema::builder(Namespace::new("records", "patients"), DataKeyId::generate())
                .build();
        assert!(schema.is_empty());
        assert!(schema.key_ids().is_empty());
    }
}
