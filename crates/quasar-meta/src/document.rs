use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Serialize};

use crate::store::{MetaStore, WatchStream};

const MAX_CAS_ATTEMPTS: usize = 16;

/// Document collections kept in the meta store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    Models,
    Tasks,
    Controllers,
    Nodes,
}

impl Index {
    pub fn as_str(self) -> &'static str {
        match self {
            Index::Models => "models",
            Index::Tasks => "tasks",
            Index::Controllers => "controllers",
            Index::Nodes => "nodes",
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub doc: T,
    pub revision: u64,
}

/// Typed JSON documents stored under `{root}/{index}/{id}`.
#[derive(Clone)]
pub struct DocumentStore {
    store: Arc<dyn MetaStore>,
    root: String,
}

impl DocumentStore {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self::with_root(store, "")
    }

    /// Namespace every key under `root` (e.g. `/quasar`).
    pub fn with_root(store: Arc<dyn MetaStore>, root: &str) -> Self {
        Self {
            store,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self, index: Index) -> String {
        format!("{}/{}/", self.root, index)
    }

    pub fn key(&self, index: Index, id: &str) -> String {
        format!("{}{}", self.prefix(index), id)
    }

    /// Id part of a key under `index`, if it belongs there.
    pub fn id_of<'a>(&self, index: Index, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix(index))
    }

    pub async fn get<T: DeserializeOwned>(&self, index: Index, id: &str) -> Result<Option<T>> {
        Ok(self.get_versioned(index, id).await?.map(|v| v.doc))
    }

    pub async fn get_versioned<T: DeserializeOwned>(
        &self,
        index: Index,
        id: &str,
    ) -> Result<Option<Versioned<T>>> {
        match self.store.get(&self.key(index, id)).await? {
            None => Ok(None),
            Some((bytes, revision)) => Ok(Some(Versioned {
                doc: serde_json::from_slice(&bytes)?,
                revision,
            })),
        }
    }

    pub async fn put<T: Serialize>(&self, index: Index, id: &str, doc: &T) -> Result<u64> {
        self.store
            .put(&self.key(index, id), serde_json::to_vec(doc)?, None)
            .await
    }

    pub async fn put_with_ttl<T: Serialize>(
        &self,
        index: Index,
        id: &str,
        doc: &T,
        ttl_ms: u64,
    ) -> Result<u64> {
        self.store
            .put(&self.key(index, id), serde_json::to_vec(doc)?, Some(ttl_ms))
            .await
    }

    /// Insert only if no document exists under `id`.
    pub async fn create<T: Serialize>(&self, index: Index, id: &str, doc: &T) -> Result<bool> {
        let (ok, _) = self
            .store
            .compare_and_swap(&self.key(index, id), 0, serde_json::to_vec(doc)?)
            .await?;
        Ok(ok)
    }

    pub async fn delete(&self, index: Index, id: &str) -> Result<bool> {
        self.store.delete(&self.key(index, id)).await
    }

    /// All documents in `index` matching `predicate`. Entries that fail to
    /// decode are logged and skipped.
    pub async fn search<T, F>(&self, index: Index, predicate: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let entries = self.store.list_prefix(&self.prefix(index)).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, bytes, _) in entries {
            match serde_json::from_slice::<T>(&bytes) {
                Ok(doc) if predicate(&doc) => out.push(doc),
                Ok(_) => {}
                Err(e) => tracing::warn!(%key, error=%e, "skipping undecodable document"),
            }
        }
        Ok(out)
    }

    /// Read-modify-write under optimistic concurrency. `apply` may run more
    /// than once; returning `false` leaves the document untouched. Returns
    /// `None` when the document does not exist.
    pub async fn update<T, F>(&self, index: Index, id: &str, mut apply: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> bool,
    {
        let key = self.key(index, id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(Versioned { mut doc, revision }) = self.get_versioned::<T>(index, id).await?
            else {
                return Ok(None);
            };
            if !apply(&mut doc) {
                return Ok(Some(doc));
            }
            let (ok, _) = self
                .store
                .compare_and_swap(&key, revision, serde_json::to_vec(&doc)?)
                .await?;
            if ok {
                return Ok(Some(doc));
            }
            tracing::debug!(%key, revision, "document changed concurrently, retrying update");
        }
        bail!("gave up updating {key} after {MAX_CAS_ATTEMPTS} conflicting writes")
    }

    pub async fn watch(&self, index: Index) -> Result<WatchStream> {
        self.store.watch_prefix(&self.prefix(index), None).await
    }
}
