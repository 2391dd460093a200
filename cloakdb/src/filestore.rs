//! JSON-file-backed document store.
//!
//! `FileStore` keeps the same semantics as [`MemoryStore`] but persists every
//! mutation to a single JSON file, so the CLI's data-key workflow survives
//! across processes. It is a development and demo backend, not a database:
//! the file is rewritten whole on each write and there is no cross-process
//! locking.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::store::{Document, DocumentStore, MemoryStore, Namespace, UpdateResult};

#[derive(Default, Serialize, Deserialize)]
struct PersistedCollection {
    docs: Vec<Document>,
    unique_indexes: BTreeSet<String>,
}

/// File-backed implementation of [`DocumentStore`].
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    // serializes the snapshot-and-write sequence across threads
    write_guard: Mutex<()>,
}

impl FileStore {
    /// Opens a store at `path`, loading existing contents if the file exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the file cannot be read and
    /// `StorageError::Serialization` if it is not a valid store file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let inner = if path.exists() {
            let bytes = fs::read(&path)?;
            let persisted: HashMap<String, PersistedCollection> =
                serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::Serialization(format!(
                        "store file {}: {e}",
                        path.display()
                    ))
                })?;
            MemoryStore::restore(
                persisted
                    .into_iter()
                    .map(|(name, coll)| (name, (coll.docs, coll.unique_indexes)))
                    .collect(),
            )
        } else {
            MemoryStore::new()
        };

        Ok(Self { path, inner, write_guard: Mutex::new(()) })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StorageError> {
        let _guard = self.write_guard.lock();
        let persisted: HashMap<String, PersistedCollection> = self
            .inner
            .snapshot()
            .into_iter()
            .map(|(name, (docs, unique_indexes))| {
                (name, PersistedCollection { docs, unique_indexes })
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        // write-then-rename so a crash never leaves a torn store file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DocumentStore for FileStore {
    fn ensure_collection(&self, ns: &Namespace) -> Result<(), StorageError> {
        self.inner.ensure_collection(ns)?;
        self.persist()
    }

    fn ensure_unique_index(&self, ns: &Namespace, path: &str) -> Result<(), StorageError> {
        self.inner.ensure_unique_index(ns, path)?;
        self.persist()
    }

    fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<(), StorageError> {
        self.inner.insert_one(ns, doc)?;
        self.persist()
    }

    fn find_one(
        &self,
        ns: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StorageError> {
        self.inner.find_one(ns, filter)
    }

    fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        set: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, StorageError> {
        let result = self.inner.update_one(ns, filter, set, upsert)?;
        if result.matched || result.upserted {
            self.persist()?;
        }
        Ok(result)
    }
}
