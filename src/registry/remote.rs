//! Remote authority contract and the in-process implementation
//!
//! Records are exchanged as untyped JSON documents; the registry validates
//! them before anything reaches bucketing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::events::Event;
use crate::{Error, Result};

/// An experiment record as stored remotely.
pub type Document = serde_json::Value;

/// Receiving side of a remote watch. Every message is the full collection.
pub type WatchReceiver = mpsc::UnboundedReceiver<Vec<Document>>;

/// Remote store of experiment records keyed by `id`, plus a remote event
/// sink.
///
/// Implementations may block on the network; callers bound every call with
/// a timeout.
pub trait RemoteStore: Send + Sync + 'static {
    /// All experiment documents.
    fn list_experiments(&self) -> impl Future<Output = Result<Vec<Document>>> + Send;

    /// Documents whose `enabled` field is `true`.
    fn query_enabled(&self) -> impl Future<Output = Result<Vec<Document>>> + Send {
        async move {
            let documents = self.list_experiments().await?;
            Ok(documents
                .into_iter()
                .filter(|doc| doc.get("enabled").and_then(Document::as_bool) == Some(true))
                .collect())
        }
    }

    /// A single document by experiment id.
    fn get_experiment(&self, id: &str) -> impl Future<Output = Result<Option<Document>>> + Send;

    /// Create or replace the document for `id`.
    fn put_experiment(
        &self,
        id: &str,
        document: Document,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the document for `id`. Returns whether it existed.
    fn delete_experiment(&self, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Subscribe to changes. The receiver gets the current collection first,
    /// then the full collection after every change, in order. Dropping the
    /// receiver releases the listener.
    fn watch(&self) -> impl Future<Output = Result<WatchReceiver>> + Send;

    /// Append an event to the remote sink.
    fn append_event(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;
}

/// In-process remote authority backed by `DashMap`.
///
/// Availability and latency can be changed at runtime to reproduce network
/// failures and hangs.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    experiments: DashMap<String, Document>,
    events: Mutex<Vec<Event>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Vec<Document>>>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self {
            experiments: DashMap::new(),
            events: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRemoteStore {
    /// Create an empty, reachable store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle reachability. Unavailable stores fail every call with
    /// `Error::RemoteUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Store a raw document without validation, notifying watchers.
    /// Documents lacking a string `id` are stored under `""`.
    pub fn insert_document(&self, document: Document) {
        let id = document
            .get("id")
            .and_then(Document::as_str)
            .unwrap_or_default()
            .to_string();
        self.experiments.insert(id, document);
        self.notify();
    }

    /// Events received by the remote sink, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Number of document records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// Whether there are no document records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Number of watchers whose receivers are still alive.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    async fn check(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteUnavailable("connection refused".to_string()))
        }
    }

    fn snapshot(&self) -> Vec<Document> {
        let mut documents: Vec<(String, Document)> = self
            .experiments
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        documents.into_iter().map(|(_, doc)| doc).collect()
    }

    fn notify(&self) {
        // Holding the watcher lock across snapshot + send keeps deliveries in
        // mutation order.
        let mut watchers = lock(&self.watchers);
        let snapshot = self.snapshot();
        watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn list_experiments(&self) -> Result<Vec<Document>> {
        self.check().await?;
        Ok(self.snapshot())
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<Document>> {
        self.check().await?;
        Ok(self.experiments.get(id).map(|doc| doc.value().clone()))
    }

    async fn put_experiment(&self, id: &str, document: Document) -> Result<()> {
        self.check().await?;
        self.experiments.insert(id.to_string(), document);
        self.notify();
        Ok(())
    }

    async fn delete_experiment(&self, id: &str) -> Result<bool> {
        self.check().await?;
        let existed = self.experiments.remove(id).is_some();
        if existed {
            self.notify();
        }
        Ok(existed)
    }

    async fn watch(&self) -> Result<WatchReceiver> {
        self.check().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watchers = lock(&self.watchers);
        // Cannot fail: `rx` is alive.
        let _ = tx.send(self.snapshot());
        watchers.push(tx);
        Ok(rx)
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        self.check().await?;
        lock(&self.events).push(event.clone());
        Ok(())
    }
}
