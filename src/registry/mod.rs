//! Experiment registry and remote synchronization
//!
//! Sourced from the compiled-in baseline or an optional remote authority,
//! selected by a persisted [`SyncMode`].
//!
//!
//! ```text
//! refresh()
//!   ├─ mode = local-only      → baseline (active only)
//!   └─ mode = remote-enabled  → query_enabled() with timeout
//!        ├─ ≥1 valid document → adopt remote set
//!        ├─ empty             → baseline (or empty, per EmptyRemotePolicy)
//!        └─ error / timeout   → baseline
//! ```
//!
//! Snapshots are swapped whole. A snapshot whose ticket is older than the
//! installed one is discarded.

mod mode;
mod remote;
mod subscription;

pub use mode::SyncMode;
pub use remote::{Document, MemoryRemoteStore, RemoteStore, WatchReceiver};
pub use subscription::Subscription;

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{EmptyRemotePolicy, ServiceConfig};
use crate::experiment::{validate_catalog, Experiment};
use crate::kv::KvStore;
use crate::{Error, Result};

/// Where the installed snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySource {
    /// Compiled-in baseline, filtered to active experiments.
    Baseline,
    /// Remote authority.
    Remote,
}

/// Outcome of [`ExperimentRegistry::sync_local_to_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Baseline experiments written to the remote store.
    pub uploaded: Vec<String>,
    /// Baseline experiments already present remotely and left untouched.
    pub skipped: Vec<String>,
    /// Source installed by the refresh that follows the migration.
    pub source: RegistrySource,
}

#[derive(Debug)]
struct Snapshot {
    ticket: u64,
    source: RegistrySource,
    experiments: Arc<Vec<Experiment>>,
}

#[derive(Debug)]
struct Shared {
    current: RwLock<Snapshot>,
    tickets: AtomicU64,
}

impl Shared {
    fn take_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read(&self) -> (RegistrySource, Arc<Vec<Experiment>>) {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        (current.source, Arc::clone(&current.experiments))
    }

    fn install(&self, ticket: u64, experiments: Vec<Experiment>, source: RegistrySource) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if ticket < current.ticket {
            tracing::debug!(ticket, installed = current.ticket, "discarding stale registry snapshot");
            return false;
        }
        tracing::debug!(ticket, ?source, count = experiments.len(), "registry snapshot installed");
        *current = Snapshot {
            ticket,
            source,
            experiments: Arc::new(experiments),
        };
        true
    }
}

fn active_baseline(baseline: &[Experiment], now: DateTime<Utc>) -> Vec<Experiment> {
    baseline
        .iter()
        .filter(|exp| exp.is_active_at(now))
        .cloned()
        .collect()
}

/// Keep valid, enabled documents with unique ids.
fn adopt_documents(documents: Vec<Document>) -> Vec<Experiment> {
    let mut seen = HashSet::new();
    let mut adopted = Vec::with_capacity(documents.len());
    for document in documents {
        match Experiment::from_document(document) {
            Ok(exp) if !exp.enabled() => {}
            Ok(exp) => {
                if seen.insert(exp.id().to_string()) {
                    adopted.push(exp);
                } else {
                    tracing::warn!(experiment = %exp.id(), "duplicate remote experiment skipped");
                }
            }
            Err(error) => tracing::warn!(%error, "rejected remote experiment document"),
        }
    }
    adopted
}

fn resolve_remote(
    fetched: Result<Vec<Experiment>>,
    policy: EmptyRemotePolicy,
    baseline: &[Experiment],
) -> (Vec<Experiment>, RegistrySource) {
    match fetched {
        Ok(experiments) if !experiments.is_empty() => (experiments, RegistrySource::Remote),
        Ok(_) if policy == EmptyRemotePolicy::AdoptEmpty => (Vec::new(), RegistrySource::Remote),
        Ok(_) => {
            tracing::info!("remote returned no enabled experiments; serving baseline");
            (active_baseline(baseline, Utc::now()), RegistrySource::Baseline)
        }
        Err(error) => {
            tracing::warn!(%error, "remote experiments unavailable; serving baseline");
            (active_baseline(baseline, Utc::now()), RegistrySource::Baseline)
        }
    }
}

async fn read_mode<S: KvStore>(store: &S, key: &str, default: SyncMode) -> SyncMode {
    match store.get(key).await {
        Ok(Some(bytes)) => match String::from_utf8(bytes)
            .map_err(|e| Error::Persistence(e.to_string()))
            .and_then(|s| s.parse())
        {
            Ok(mode) => mode,
            Err(error) => {
                tracing::warn!(%error, "persisted sync mode unreadable; using default");
                default
            }
        },
        Ok(None) => default,
        Err(error) => {
            tracing::warn!(%error, "sync mode could not be read; using default");
            default
        }
    }
}

async fn bounded<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, call).await.map_err(|_| {
        Error::RemoteUnavailable(format!("timed out after {}ms", timeout.as_millis()))
    })?
}

/// Registry of experiments with baseline/remote synchronization.
pub struct ExperimentRegistry<S: KvStore, R: RemoteStore> {
    shared: Arc<Shared>,
    baseline: Arc<[Experiment]>,
    remote: Option<Arc<R>>,
    store: Arc<S>,
    mode_key: String,
    default_mode: SyncMode,
    timeout: Duration,
    empty_policy: EmptyRemotePolicy,
}

impl<S: KvStore, R: RemoteStore> ExperimentRegistry<S, R> {
    /// Create a registry serving the active baseline until `initialize`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the baseline is malformed or
    /// contains duplicate ids.
    pub fn new(
        baseline: Vec<Experiment>,
        store: Arc<S>,
        remote: Option<Arc<R>>,
        config: &ServiceConfig,
    ) -> Result<Self> {
        validate_catalog(&baseline)?;
        let initial = active_baseline(&baseline, Utc::now());
        Ok(Self {
            shared: Arc::new(Shared {
                current: RwLock::new(Snapshot {
                    ticket: 0,
                    source: RegistrySource::Baseline,
                    experiments: Arc::new(initial),
                }),
                tickets: AtomicU64::new(0),
            }),
            baseline: baseline.into(),
            remote,
            store,
            mode_key: config.key("sync_mode"),
            default_mode: config.default_mode,
            timeout: config.remote_timeout(),
            empty_policy: config.empty_remote,
        })
    }

    /// Load the registry for the first time. Never fails; see [`Self::refresh`].
    pub async fn initialize(&self) -> RegistrySource {
        let source = self.refresh().await;
        tracing::info!(?source, count = self.snapshot().len(), "experiment registry initialized");
        source
    }

    /// Re-run fetch-or-fallback and swap in the result. Safe to call
    /// concurrently; never fails.
    pub async fn refresh(&self) -> RegistrySource {
        let ticket = self.shared.take_ticket();
        let (experiments, source) = match self.mode().await {
            SyncMode::LocalOnly => (
                active_baseline(&self.baseline, Utc::now()),
                RegistrySource::Baseline,
            ),
            SyncMode::RemoteEnabled => {
                let fetched = self.fetch_remote().await;
                resolve_remote(fetched, self.empty_policy, &self.baseline)
            }
        };
        self.shared.install(ticket, experiments, source);
        source
    }

    async fn fetch_remote(&self) -> Result<Vec<Experiment>> {
        let remote = self.require_remote()?;
        let documents = bounded(self.timeout, remote.query_enabled()).await?;
        Ok(adopt_documents(documents))
    }

    fn require_remote(&self) -> Result<&Arc<R>> {
        self.remote
            .as_ref()
            .ok_or_else(|| Error::RemoteUnavailable("no remote store configured".to_string()))
    }

    /// Current persisted mode. Unreadable or missing values yield the
    /// configured default.
    pub async fn mode(&self) -> SyncMode {
        read_mode(&*self.store, &self.mode_key, self.default_mode).await
    }

    /// Persist a new mode. Takes effect on the next refresh.
    ///
    /// # Errors
    ///
    /// Returns the store error if the flag cannot be written.
    pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        self.store
            .set(&self.mode_key, mode.as_str().as_bytes().to_vec())
            .await?;
        tracing::info!(%mode, "sync mode changed");
        Ok(())
    }

    /// Subscribe to remote changes. Each change installs the full validated
    /// collection and passes it to `callback`; ignored while `local-only`.
    /// Without a reachable remote the handle is inert.
    pub async fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Experiment]) + Send + Sync + 'static,
    {
        let Ok(remote) = self.require_remote() else {
            return Subscription::inert();
        };
        let mut rx = match bounded(self.timeout, remote.watch()).await {
            Ok(rx) => rx,
            Err(error) => {
                tracing::warn!(%error, "live experiment updates unavailable");
                return Subscription::inert();
            }
        };

        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let shared = Arc::clone(&self.shared);
        let baseline = Arc::clone(&self.baseline);
        let store = Arc::clone(&self.store);
        let mode_key = self.mode_key.clone();
        let default_mode = self.default_mode;
        let policy = self.empty_policy;

        let task = tokio::spawn(async move {
            while let Some(documents) = rx.recv().await {
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if read_mode(&*store, &mode_key, default_mode).await
                    == SyncMode::LocalOnly
                {
                    continue;
                }
                let ticket = shared.take_ticket();
                let (experiments, source) =
                    resolve_remote(Ok(adopt_documents(documents)), policy, &baseline);
                if shared.install(ticket, experiments, source) && flag.load(Ordering::SeqCst) {
                    let (_, installed) = shared.read();
                    callback(&installed);
                }
            }
        });

        tracing::debug!("experiment subscription opened");
        Subscription::new(active, task)
    }

    /// One-time migration: write every baseline experiment missing remotely,
    /// switch to `remote-enabled`, then refresh.
    ///
    /// # Errors
    ///
    /// `Error::RemoteUnavailable` on any remote failure; the mode is left
    /// unchanged.
    pub async fn sync_local_to_remote(&self) -> Result<SyncReport> {
        let remote = self.require_remote()?;
        let existing: HashSet<String> = bounded(self.timeout, remote.list_experiments())
            .await?
            .iter()
            .filter_map(|doc| doc.get("id").and_then(Document::as_str).map(str::to_string))
            .collect();

        let mut uploaded = Vec::new();
        let mut skipped = Vec::new();
        for experiment in self.baseline.iter() {
            if existing.contains(experiment.id()) {
                skipped.push(experiment.id().to_string());
                continue;
            }
            let document = experiment.to_document()?;
            bounded(self.timeout, remote.put_experiment(experiment.id(), document)).await?;
            uploaded.push(experiment.id().to_string());
        }

        self.set_mode(SyncMode::RemoteEnabled).await?;
        let source = self.refresh().await;
        tracing::info!(
            uploaded = uploaded.len(),
            skipped = skipped.len(),
            ?source,
            "baseline experiments synced to remote"
        );
        Ok(SyncReport {
            uploaded,
            skipped,
            source,
        })
    }

    /// Create a new remote experiment.
    ///
    /// # Errors
    ///
    /// `Error::Configuration` if the definition is invalid or the id already
    /// exists; `Error::RemoteUnavailable` on remote failure.
    pub async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        experiment.validate()?;
        let remote = self.require_remote()?;
        if bounded(self.timeout, remote.get_experiment(experiment.id()))
            .await?
            .is_some()
        {
            return Err(Error::Configuration(format!(
                "experiment {} already exists",
                experiment.id()
            )));
        }
        let document = experiment.to_document()?;
        bounded(self.timeout, remote.put_experiment(experiment.id(), document)).await?;
        tracing::info!(experiment = %experiment.id(), "experiment created");
        self.refresh_if_remote().await;
        Ok(())
    }

    /// Replace an existing remote experiment.
    ///
    /// # Errors
    ///
    /// `Error::Configuration` if the definition is invalid,
    /// `Error::ExperimentNotFound` if the id is unknown remotely and
    /// `Error::RemoteUnavailable` on remote failure.
    pub async fn update_experiment(&self, experiment: &Experiment) -> Result<()> {
        experiment.validate()?;
        let remote = self.require_remote()?;
        if bounded(self.timeout, remote.get_experiment(experiment.id()))
            .await?
            .is_none()
        {
            return Err(Error::ExperimentNotFound(experiment.id().to_string()));
        }
        let document = experiment.to_document()?;
        bounded(self.timeout, remote.put_experiment(experiment.id(), document)).await?;
        tracing::info!(experiment = %experiment.id(), "experiment updated");
        self.refresh_if_remote().await;
        Ok(())
    }

    /// Delete a remote experiment.
    ///
    /// # Errors
    ///
    /// `Error::ExperimentNotFound` if the id is unknown remotely and
    /// `Error::RemoteUnavailable` on remote failure.
    pub async fn delete_experiment(&self, id: &str) -> Result<()> {
        let remote = self.require_remote()?;
        if !bounded(self.timeout, remote.delete_experiment(id)).await? {
            return Err(Error::ExperimentNotFound(id.to_string()));
        }
        tracing::info!(experiment = %id, "experiment deleted");
        self.refresh_if_remote().await;
        Ok(())
    }

    async fn refresh_if_remote(&self) {
        if self.mode().await == SyncMode::RemoteEnabled {
            self.refresh().await;
        }
    }

    /// Immutable view of the installed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Experiment>> {
        self.shared.read().1
    }

    /// Source of the installed snapshot.
    #[must_use]
    pub fn source(&self) -> RegistrySource {
        self.shared.read().0
    }

    /// Experiments in the snapshot that are active at `now`.
    #[must_use]
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<Experiment> {
        self.snapshot()
            .iter()
            .filter(|exp| exp.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Experiments active right now.
    #[must_use]
    pub fn active(&self) -> Vec<Experiment> {
        self.active_at(Utc::now())
    }

    /// Look up an experiment in the installed snapshot.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Experiment> {
        self.snapshot().iter().find(|exp| exp.id() == id).cloned()
    }

    /// The compiled-in baseline, unfiltered.
    #[must_use]
    pub fn baseline(&self) -> &[Experiment] {
        &self.baseline
    }
}
