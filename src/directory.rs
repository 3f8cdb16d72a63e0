//! Shared key/value directory used as presence registry and signaling relay.
//!
//! The directory is eventually consistent and multi-writer. Values are JSON;
//! writing `None` is a tombstone. Nothing here acknowledges writes, so callers
//! treat every `put` as best-effort.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

/// One observed change under a subscribed prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<Value>,
}

pub type Subscription = mpsc::UnboundedReceiver<DirectoryChange>;

#[async_trait]
pub trait SharedDirectory: Send + Sync {
    async fn put(&self, key: &str, value: Option<Value>);

    /// One-shot snapshot read of a single key.
    async fn get(&self, key: &str) -> Option<Value>;

    /// One-shot snapshot of every live key starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Vec<(String, Value)>;

    /// Streams every change under `prefix`, starting with the values present now.
    /// Delivery order relative to other prefixes is not guaranteed.
    async fn subscribe(&self, prefix: &str) -> Subscription;
}

/// In-process directory shared by every participant holding a clone.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<DirectoryChange>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock cannot leave the map half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedDirectory for MemoryDirectory {
    async fn put(&self, key: &str, value: Option<Value>) {
        let mut inner = self.lock();
        let changed = match &value {
            Some(v) => inner.entries.insert(key.to_string(), v.clone()).as_ref() != Some(v),
            None => inner.entries.remove(key).is_some(),
        };
        if !changed {
            return;
        }
        trace!("directory put {key} -> {}", if value.is_some() { "value" } else { "null" });

        let change = DirectoryChange {
            key: key.to_string(),
            value,
        };
        inner.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(change.clone()).is_ok()
        });
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.lock().entries.get(key).cloned()
    }

    async fn scan(&self, prefix: &str) -> Vec<(String, Value)> {
        self.lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn subscribe(&self, prefix: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for (key, value) in inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            let _ = tx.send(DirectoryChange {
                key: key.clone(),
                value: Some(value.clone()),
            });
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }
}
