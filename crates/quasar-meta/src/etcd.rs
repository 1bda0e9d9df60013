use std::sync::Arc;

use anyhow::{Context, Result};
use etcd_client::{
    Client, Compare, CompareOp, Event, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::store::{MetaStore, WatchEvent, WatchStream};

/// etcd-backed store. TTL puts attach a fresh lease, so a worker that stops
/// heartbeating disappears from `/nodes/` and watchers see a delete.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .with_context(|| format!("connect etcd at {}", endpoints.join(",")))?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    fn lease_seconds(ttl_ms: u64) -> i64 {
        ttl_ms.div_ceil(1000).max(1) as i64
    }

    fn to_watch_event(ev: &Event) -> Option<WatchEvent> {
        let kv = ev.kv()?;
        let value = match ev.event_type() {
            EventType::Put => Some(kv.value().to_vec()),
            EventType::Delete => None,
        };
        Some(WatchEvent {
            key: String::from_utf8_lossy(kv.key()).to_string(),
            value,
            revision: kv.mod_revision() as u64,
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let opts = match ttl_ms {
            Some(ttl_ms) => {
                let lease = cli.lease_grant(Self::lease_seconds(ttl_ms), None).await?;
                Some(PutOptions::new().with_lease(lease.id()))
            }
            None => None,
        };
        let resp = cli.put(key, value, opts).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;

        let txn = Txn::new()
            .when([Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_revision as i64,
            )])
            .and_then([TxnOp::put(key, value, None)])
            .or_else([TxnOp::get(key, None)]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok((true, rev as u64));
        }

        let current = cli.get(key, None).await?;
        let current_rev = current
            .kvs()
            .first()
            .map_or(0, |kv| kv.mod_revision() as u64);
        Ok((false, current_rev))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let mut cli = self.client.lock().await;

        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = start_revision_exclusive {
            // etcd start_revision is inclusive
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }
        let (watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(1024);
        tokio::spawn(async move {
            // dropping the watcher cancels the server-side watch
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events().iter().filter_map(Self::to_watch_event) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
