//! Document store abstraction.
//!
//! This module provides a trait-based store interface that can be implemented
//! for various backends, plus an in-memory backend for tests and
//! single-process use. Filters are flat maps of dotted field path to required
//! value, matched structurally; no richer query language is offered.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, StorageError};

/// A document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// A fully-qualified collection namespace: database plus collection.
///
/// # Example
///
/// ```
/// use cloakdb::store::Namespace;
///
/// let ns = Namespace::new("encryption", "__keyVault");
/// assert_eq!(ns.full_name(), "encryption.__keyVault");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Creates a namespace from a database name and a collection name.
    #[must_use]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self { db: db.into(), coll: coll.into() }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the collection name.
    #[must_use]
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Returns the dotted `database.collection` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
                Ok(Self::new(db, coll))
            }
            _ => Err(Error::EncryptionConfig(format!(
                "namespace must be '<db>.<collection>', got '{s}'"
            ))),
        }
    }
}

/// Looks up a value by dotted path, descending through nested objects.
///
/// Array elements are not addressable; a path segment into a non-object
/// yields `None`.
#[must_use]
pub fn path_get<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Replaces the value at a dotted path, descending through nested objects.
///
/// Returns `false` if an intermediate segment is missing or not an object;
/// intermediate objects are never created.
pub fn path_set(doc: &mut Document, path: &str, value: Value) -> bool {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => match doc.get_mut(head).and_then(Value::as_object_mut) {
            Some(inner) => path_set(inner, rest, value),
            None => false,
        },
    }
}

/// Returns `true` when every filter entry matches the document.
///
/// Filter keys are dotted paths; values are compared structurally.
#[must_use]
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| path_get(doc, path) == Some(expected))
}

/// Outcome of an update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    /// An existing document matched the filter and was updated.
    pub matched: bool,
    /// No document matched and a new one was inserted.
    pub upserted: bool,
}

/// Storage backend for document collections.
///
/// The key vault and both client flavors speak to the database exclusively
/// through this trait. Implementations must be thread-safe.
pub trait DocumentStore: Send + Sync {
    /// Creates the collection if it does not exist. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend is unavailable.
    fn ensure_collection(&self, ns: &Namespace) -> Result<(), StorageError>;

    /// Creates a unique index on the given field path. Idempotent.
    ///
    /// Documents lacking the field do not participate in the index.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DuplicateKey` if existing documents already
    /// violate the constraint.
    fn ensure_unique_index(&self, ns: &Namespace, path: &str) -> Result<(), StorageError>;

    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DuplicateKey` if a unique index rejects the
    /// document.
    fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<(), StorageError>;

    /// Returns the first document matching the filter, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend is unavailable.
    fn find_one(&self, ns: &Namespace, filter: &Document)
        -> Result<Option<Document>, StorageError>;

    /// Updates the first document matching the filter by replacing its
    /// top-level fields with those of `set`.
    ///
    /// With `upsert`, a non-match inserts `set` as a new document (top-level
    /// filter equality fields absent from `set` are merged in).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DuplicateKey` if the resulting document would
    /// violate a unique index.
    fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        set: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError>;
}

#[derive(Default)]
struct Collection {
    docs: Vec<Document>,
    unique_indexes: BTreeSet<String>,
}

impl Collection {
    /// Rejects `doc` if an indexed value collides with any document other
    /// than the one at `skip`.
    fn check_unique(&self, doc: &Document, skip: Option<usize>) -> Result<(), StorageError> {
        for path in &self.unique_indexes {
            let Some(value) = path_get(doc, path) else { continue };
            let collision = self
                .docs
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .any(|(_, existing)| path_get(existing, path) == Some(value));
            if collision {
                return Err(StorageError::DuplicateKey { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// In-memory implementation of [`DocumentStore`].
///
/// Suitable for tests and single-process demos. Data is lost when the
/// process terminates.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the full store contents, collection by collection.
    pub(crate) fn snapshot(&self) -> HashMap<String, (Vec<Document>, BTreeSet<String>)> {
        self.collections
            .read()
            .iter()
            .map(|(name, coll)| {
                (name.clone(), (coll.docs.clone(), coll.unique_indexes.clone()))
            })
            .collect()
    }

    /// Rebuilds a store from a [`snapshot`](Self::snapshot).
    pub(crate) fn restore(
        snapshot: HashMap<String, (Vec<Document>, BTreeSet<String>)>,
    ) -> Self {
        let collections = snapshot
            .into_iter()
            .map(|(name, (docs, unique_indexes))| {
                (name, Collection { docs, unique_indexes })
            })
            .collect();
        Self { collections: RwLock::new(collections) }
    }
}

impl DocumentStore for MemoryStore {
    fn ensure_collection(&self, ns: &Namespace) -> Result<(), StorageError> {
        self.collections.write().entry(ns.full_name()).or_default();
        Ok(())
    }

    fn ensure_unique_index(&self, ns: &Namespace, path: &str) -> Result<(), StorageError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(ns.full_name()).or_default();

        let mut seen = Vec::new();
        for doc in &coll.docs {
            if let Some(value) = path_get(doc, path) {
                if seen.contains(&value) {
                    return Err(StorageError::DuplicateKey { path: path.to_string() });
                }
                seen.push(value);
            }
        }

        coll.unique_indexes.insert(path.to_string());
        Ok(())
    }

    fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<(), StorageError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(ns.full_name()).or_default();
        coll.check_unique(&doc, None)?;
        coll.docs.push(doc);
        Ok(())
    }

    fn find_one(
        &self,
        ns: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&ns.full_name())
            .and_then(|coll| coll.docs.iter().find(|doc| matches_filter(doc, filter)).cloned()))
    }

    fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        set: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError> {
        let mut collections = self.collections.write();
        let coll = collections.entry(ns.full_name()).or_default();

        if let Some(pos) = coll.docs.iter().position(|doc| matches_filter(doc, filter)) {
            let mut updated = coll.docs[pos].clone();
            for (key, value) in set {
                updated.insert(key.clone(), value.clone());
            }
            coll.check_unique(&updated, Some(pos))?;
            coll.docs[pos] = updated;
            return Ok(UpdateResult { matched: true, upserted: false });
        }

        if !upsert {
            return Ok(UpdateResult { matched: false, upserted: false });
        }

        let mut doc = set.clone();
        for (path, value) in filter {
            if !path.contains('.') && !doc.contains_key(path) {
                doc.insert(path.clone(), value.clone());
            }
        }
        coll.check_unique(&doc, None)?;
        coll.docs.push(doc);
        Ok(UpdateResult { matched: false, upserted: true })
    }
}
