//! View, conversion and assignment events
//!
//! Events are appended to a bounded local log (oldest dropped first) and,
//! when remote sync is enabled, delivered best-effort to the remote sink.
//! Neither sink can fail the caller: errors are logged and swallowed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::kv::KvStore;
use crate::registry::RemoteStore;
use crate::Result;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The variant was shown.
    View,
    /// The goal was reached.
    Conversion,
    /// The identity was bucketed into the variant.
    Assignment,
}

/// A tracked event, tagged with the resolved variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    timestamp: DateTime<Utc>,
    kind: EventKind,
    test_id: String,
    variant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, test_id: impl Into<String>, variant_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            test_id: test_id.into(),
            variant_id: variant_id.into(),
            metadata: None,
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Get the variant ID.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Get the metadata, if any.
    #[must_use]
    pub const fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }
}

/// Bounded, persisted, ordered event log.
///
/// Loaded lazily on first use. An unreadable payload is replaced by an
/// empty log.
pub struct EventLog<S: KvStore> {
    store: Arc<S>,
    key: String,
    capacity: usize,
    events: Mutex<Option<VecDeque<Event>>>,
}

impl<S: KvStore> EventLog<S> {
    /// Create a log persisted under `key`, keeping at most `capacity` events
    /// (at least one).
    #[must_use]
    pub fn new(store: Arc<S>, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key: key.into(),
            capacity: capacity.max(1),
            events: Mutex::new(None),
        }
    }

    /// Maximum number of retained events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    async fn load(&self) -> VecDeque<Event> {
        match self.store.get_json::<Vec<Event>>(&self.key).await {
            Ok(Some(events)) => events.into(),
            Ok(None) => VecDeque::new(),
            Err(error) => {
                tracing::warn!(%error, "event log unreadable; starting empty");
                VecDeque::new()
            }
        }
    }

    /// Append an event, dropping the oldest beyond capacity, and persist.
    ///
    /// The event stays in memory even if persisting fails.
    ///
    /// # Errors
    ///
    /// Returns the store error if the log cannot be persisted.
    pub async fn append(&self, event: Event) -> Result<()> {
        let mut guard = self.events.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await);
        }
        let events = guard.get_or_insert_with(VecDeque::new);
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
        self.store.set_json(&self.key, &*events).await
    }

    /// Copy of the retained events, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        let mut guard = self.events.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await);
        }
        guard
            .as_ref()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of retained events.
    pub async fn len(&self) -> usize {
        self.events().await.len()
    }

    /// Whether no events are retained.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every event, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns the store error if the persisted log cannot be deleted.
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.events.lock().await;
        *guard = Some(VecDeque::new());
        self.store.delete(&self.key).await
    }
}

/// Emits events to the local log and, optionally, the remote sink.
///
/// The caller resolves the assignment first: no variant means no event.
pub struct EventTracker<S: KvStore, R: RemoteStore> {
    log: EventLog<S>,
    remote: Option<Arc<R>>,
    timeout: Duration,
    in_flight: StdMutex<Vec<JoinHandle<()>>>,
}

impl<S: KvStore, R: RemoteStore> EventTracker<S, R> {
    /// Create a tracker writing to `log` and, when given, `remote`.
    #[must_use]
    pub fn new(log: EventLog<S>, remote: Option<Arc<R>>, timeout: Duration) -> Self {
        Self {
            log,
            remote,
            timeout,
            in_flight: StdMutex::new(Vec::new()),
        }
    }

    /// The local event log.
    #[must_use]
    pub const fn log(&self) -> &EventLog<S> {
        &self.log
    }

    /// Record a view of the resolved variant. No-op without one.
    ///
    /// Repeated calls record repeated views.
    pub async fn record_view(
        &self,
        test_id: &str,
        variant_id: Option<&str>,
        remote_enabled: bool,
    ) -> Option<Event> {
        let event = Event::new(EventKind::View, test_id, variant_id?);
        self.emit(event.clone(), remote_enabled).await;
        Some(event)
    }

    /// Record a conversion of the resolved variant. No-op without one.
    pub async fn record_conversion(
        &self,
        test_id: &str,
        variant_id: Option<&str>,
        metadata: Option<serde_json::Value>,
        remote_enabled: bool,
    ) -> Option<Event> {
        let mut event = Event::new(EventKind::Conversion, test_id, variant_id?);
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }
        self.emit(event.clone(), remote_enabled).await;
        Some(event)
    }

    /// Record that an identity was bucketed into a variant.
    pub async fn record_assignment(
        &self,
        test_id: &str,
        variant_id: &str,
        remote_enabled: bool,
    ) -> Event {
        let event = Event::new(EventKind::Assignment, test_id, variant_id);
        self.emit(event.clone(), remote_enabled).await;
        event
    }

    async fn emit(&self, event: Event, remote_enabled: bool) {
        tracing::debug!(
            kind = ?event.kind(),
            test_id = %event.test_id(),
            variant_id = %event.variant_id(),
            "event recorded"
        );

        if remote_enabled {
            if let Some(remote) = &self.remote {
                self.deliver_remote(Arc::clone(remote), event.clone());
            }
        }

        if let Err(error) = self.log.append(event).await {
            tracing::warn!(%error, "event not persisted locally");
        }
    }

    fn deliver_remote(&self, remote: Arc<R>, event: Event) {
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, remote.append_event(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(%error, test_id = %event.test_id(), "remote event sink failed");
                }
                Err(_) => {
                    tracing::warn!(test_id = %event.test_id(), "remote event sink timed out");
                }
            }
        });
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(handle);
    }

    /// Wait for every pending remote delivery to finish or time out.
    pub async fn flush(&self) {
        let pending = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in pending {
            // A panicked delivery task is already lost; nothing to recover.
            let _ = task.await;
        }
    }
}
