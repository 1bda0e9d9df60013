use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::store::{MetaStore, WatchEvent, WatchStream};

/// In-process store for tests and single-binary setups.
///
/// Keys written with a TTL expire lazily: reads skip them, and
/// [`MemoryMetaStore::purge_expired`] removes them and emits delete events
/// the way an etcd lease expiry would.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Entry>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn live_revision(&self, key: &str, now: Instant) -> u64 {
        self.kv
            .get(key)
            .filter(|e| e.live(now))
            .map_or(0, |e| e.revision)
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Drop expired keys, emitting one delete event per key. Returns the
    /// removed keys.
    pub async fn purge_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let events: Vec<WatchEvent> = {
            let mut inner = self.inner.write().await;
            let expired: Vec<String> = inner
                .kv
                .iter()
                .filter(|(_, e)| !e.live(now))
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .map(|key| {
                    inner.kv.remove(&key);
                    let revision = inner.bump();
                    WatchEvent {
                        key,
                        value: None,
                        revision,
                    }
                })
                .collect()
        };
        let keys = events.iter().map(|e| e.key.clone()).collect();
        for event in events {
            self.emit(event);
        }
        keys
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let expires_at = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let event = {
            let mut inner = self.inner.write().await;
            let revision = inner.bump();
            inner.kv.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    revision,
                    expires_at,
                },
            );
            WatchEvent {
                key: key.to_string(),
                value: Some(value),
                revision,
            }
        };
        let revision = event.revision;
        self.emit(event);
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| (e.value.clone(), e.revision)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let event = {
            let mut inner = self.inner.write().await;
            match inner.kv.remove(key) {
                None => None,
                Some(_) => {
                    let revision = inner.bump();
                    Some(WatchEvent {
                        key: key.to_string(),
                        value: None,
                        revision,
                    })
                }
            }
        };
        let existed = event.is_some();
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.live(now))
            .map(|(k, e)| (k.clone(), e.value.clone(), e.revision))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let event = {
            let mut inner = self.inner.write().await;
            let current = inner.live_revision(key, Instant::now());
            if current != expected_revision {
                return Ok((false, current));
            }
            let revision = inner.bump();
            inner.kv.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    revision,
                    expires_at: None,
                },
            );
            WatchEvent {
                key: key.to_string(),
                value: Some(value),
                revision,
            }
        };
        let revision = event.revision;
        self.emit(event);
        Ok((true, revision))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |msg| {
            msg.ok()
                .filter(|ev| ev.revision > min_rev && ev.key.starts_with(&prefix))
        });
        Ok(Box::pin(stream))
    }
}
