//! RAM-first key/value cache with write-behind persistence.
//!
//! Reads never leave memory. Writes update memory immediately and are queued
//! to a single writer thread, so operations on one key reach the backing store
//! in submission order and the last write wins. Backing-store failures are
//! logged and otherwise ignored: memory is authoritative until the next load.

use std::hash::Hash;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Durable home of a cache's data.
pub trait BackingStore<K, V>: Send + Sync + 'static {
    fn load_all(&self) -> Result<Vec<(K, V)>>;
    fn persist(&self, key: &K, value: &V) -> Result<()>;
    fn delete(&self, key: &K) -> Result<()>;
}

enum WriteOp<K, V> {
    Persist(K, V),
    Delete(K),
    /// Acknowledged once every earlier op has been applied.
    Barrier(Sender<()>),
}

pub struct WriteBehindCache<K, V> {
    name: String,
    data: RwLock<FxHashMap<K, V>>,
    store: Arc<dyn BackingStore<K, V>>,
    tx: Option<Sender<WriteOp<K, V>>>,
    worker: Option<JoinHandle<()>>,
}

impl<K, V> WriteBehindCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache and start its writer thread. Call [`load`](Self::load)
    /// to populate it.
    pub fn new(name: impl Into<String>, store: Arc<dyn BackingStore<K, V>>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<WriteOp<K, V>>();
        let worker_store = Arc::clone(&store);
        let worker_name = name.clone();
        // Let the writer log through whatever subscriber the owner uses.
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let worker = std::thread::Builder::new()
            .name(format!("{name}-writer"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    run_writer(&worker_name, worker_store.as_ref(), &rx);
                });
            })
            .with_context(|| format!("spawning writer thread for cache {name}"))?;

        Ok(Self {
            name,
            data: RwLock::new(FxHashMap::default()),
            store,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Replace memory with the backing store's contents. Returns the number of
    /// entries loaded.
    pub fn load(&self) -> Result<usize> {
        let rows = self
            .store
            .load_all()
            .with_context(|| format!("loading cache {}", self.name))?;
        let mut data = self.data.write();
        data.clear();
        data.extend(rows);
        debug!(cache = %self.name, entries = data.len(), "cache_loaded");
        Ok(data.len())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        // Queue under the write lock so the store sees writes in memory order.
        let mut data = self.data.write();
        data.insert(key.clone(), value.clone());
        self.enqueue(WriteOp::Persist(key, value));
    }

    pub fn delete(&self, key: &K) {
        let mut data = self.data.write();
        data.remove(key);
        self.enqueue(WriteOp::Delete(key.clone()));
    }

    /// Every value, in no particular order.
    pub fn list(&self) -> Vec<V> {
        self.data.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Block until every write and delete queued so far has been applied.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.enqueue(WriteOp::Barrier(ack_tx)) && ack_rx.recv().is_err() {
            warn!(cache = %self.name, "writer exited before flush completed");
        }
    }

    fn enqueue(&self, op: WriteOp<K, V>) -> bool {
        match &self.tx {
            Some(tx) if tx.send(op).is_ok() => true,
            _ => {
                warn!(cache = %self.name, "writer thread is gone; change kept in memory only");
                false
            }
        }
    }
}

impl<K, V> Drop for WriteBehindCache<K, V> {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(cache = %self.name, "writer thread panicked");
        }
    }
}

fn run_writer<K: std::fmt::Debug + 'static, V: 'static>(
    name: &str,
    store: &dyn BackingStore<K, V>,
    rx: &Receiver<WriteOp<K, V>>,
) {
    for op in rx.iter() {
        match op {
            WriteOp::Persist(key, value) => {
                if let Err(e) = store.persist(&key, &value) {
                    let error = format!("{e:#}");
                    warn!(cache = name, key = ?key, %error, "cache_persist_failed");
                }
            }
            WriteOp::Delete(key) => {
                if let Err(e) = store.delete(&key) {
                    let error = format!("{e:#}");
                    warn!(cache = name, key = ?key, %error, "cache_delete_failed");
                }
            }
            WriteOp::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(cache = name, "writer drained");
}
