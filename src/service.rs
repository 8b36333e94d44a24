//! Process-wide experiment service
//!
//! Built once at application start, `init()`ed, and `shutdown()` at exit.
//! Consumer-facing methods never fail: an unavailable experiment system
//! degrades to "no experiment active".

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::assignment::{AssignmentOutcome, AssignmentStore};
use crate::config::ServiceConfig;
use crate::events::{Event, EventLog, EventTracker};
use crate::experiment::Experiment;
use crate::identity::IdentityManager;
use crate::kv::{KvStore, MemoryKvStore};
use crate::registry::{
    ExperimentRegistry, MemoryRemoteStore, RegistrySource, RemoteStore, Subscription, SyncMode,
    SyncReport,
};
use crate::report::{summarize, ExperimentReport};
use crate::Result;

/// The experiment assignment and tracking engine.
pub struct ExperimentService<S: KvStore = MemoryKvStore, R: RemoteStore = MemoryRemoteStore> {
    config: ServiceConfig,
    identity: IdentityManager<S>,
    registry: ExperimentRegistry<S, R>,
    assignments: AssignmentStore<S>,
    tracker: EventTracker<S, R>,
    live: Mutex<Option<Subscription>>,
}

impl ExperimentService {
    /// Create a builder with an in-memory store and no remote.
    #[must_use]
    pub fn builder() -> ExperimentServiceBuilder {
        ExperimentServiceBuilder::default()
    }
}

impl<S: KvStore, R: RemoteStore> ExperimentService<S, R> {
    /// Load the registry (remote or baseline) and, if configured, start
    /// live updates. Never fails.
    pub async fn init(&self) -> RegistrySource {
        let source = self.registry.initialize().await;
        if self.config.live_updates && self.registry.mode().await == SyncMode::RemoteEnabled {
            let subscription = self.registry.subscribe(|_| {}).await;
            *self.live.lock().await = Some(subscription);
        }
        source
    }

    /// Stop live updates and wait for pending remote event deliveries.
    pub async fn shutdown(&self) {
        if let Some(mut subscription) = self.live.lock().await.take() {
            subscription.unsubscribe();
        }
        self.tracker.flush().await;
        tracing::debug!("experiment service shut down");
    }

    /// The service configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The installation identity, or `None` if local storage is unusable.
    pub async fn identity(&self) -> Option<String> {
        match self.identity.get_or_create().await {
            Ok(identity) => Some(identity),
            Err(error) => {
                tracing::warn!(%error, "identity unavailable; experiments disabled");
                None
            }
        }
    }

    async fn resolve(&self) -> Option<(String, AssignmentOutcome)> {
        let identity = self.identity().await?;
        let active = self.registry.active();
        match self.assignments.get_assignments(&identity, &active).await {
            Ok(outcome) => Some((identity, outcome)),
            Err(error) => {
                tracing::error!(%error, "assignments unavailable");
                None
            }
        }
    }

    async fn record_assignments(&self, outcome: &AssignmentOutcome) {
        if outcome.newly_assigned.is_empty() {
            return;
        }
        let remote_enabled = self.remote_enabled().await;
        for (test_id, variant_id) in &outcome.newly_assigned {
            self.tracker
                .record_assignment(test_id, variant_id, remote_enabled)
                .await;
        }
    }

    async fn remote_enabled(&self) -> bool {
        self.registry.mode().await == SyncMode::RemoteEnabled
    }

    /// `test_id → variant_id` for every active experiment. Empty if the
    /// experiment system is unavailable.
    pub async fn assignments(&self) -> BTreeMap<String, String> {
        match self.resolve().await {
            Some((_, outcome)) => {
                self.record_assignments(&outcome).await;
                outcome.assignments
            }
            None => BTreeMap::new(),
        }
    }

    /// The variant assigned for `test_id`, or `None` if the experiment is
    /// not active.
    pub async fn get_variant(&self, test_id: &str) -> Option<String> {
        self.assignments().await.remove(test_id)
    }

    /// Whether the identity is assigned `variant_id` in `test_id`.
    pub async fn is_variant(&self, test_id: &str, variant_id: &str) -> bool {
        self.get_variant(test_id).await.as_deref() == Some(variant_id)
    }

    /// The existing assignment for an active `test_id`, without bucketing.
    async fn current_variant(&self, test_id: &str) -> Option<String> {
        let identity = self.identity().await?;
        self.assignments
            .current(&identity, test_id, &self.registry.active())
            .await
    }

    /// Record a view of the assigned variant. No-op if `test_id` is inactive
    /// or has not been assigned yet. Repeated calls record repeated views.
    pub async fn record_view(&self, test_id: &str) -> Option<Event> {
        let variant = self.current_variant(test_id).await;
        let remote_enabled = self.remote_enabled().await;
        self.tracker
            .record_view(test_id, variant.as_deref(), remote_enabled)
            .await
    }

    /// Record a conversion of the assigned variant. Same no-op rule as
    /// [`Self::record_view`].
    pub async fn record_conversion(
        &self,
        test_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> Option<Event> {
        let variant = self.current_variant(test_id).await;
        let remote_enabled = self.remote_enabled().await;
        self.tracker
            .record_conversion(test_id, variant.as_deref(), metadata, remote_enabled)
            .await
    }

    /// Clear and recompute every assignment for the active experiments.
    ///
    /// # Errors
    ///
    /// Returns the identity store error if no identity can be obtained, or
    /// `Error::Assignment` for an experiment without variants.
    pub async fn reset_all(&self) -> Result<BTreeMap<String, String>> {
        let identity = self.identity.get_or_create().await?;
        let outcome = self
            .assignments
            .reset_all(&identity, &self.registry.active())
            .await?;
        self.record_assignments(&outcome).await;
        Ok(outcome.assignments)
    }

    /// Re-run fetch-or-fallback for the registry. Never fails.
    pub async fn refresh(&self) -> RegistrySource {
        self.registry.refresh().await
    }

    /// Push missing baseline experiments to the remote, enable remote mode
    /// and refresh. See [`ExperimentRegistry::sync_local_to_remote`].
    #[allow(clippy::missing_errors_doc)]
    pub async fn sync_local_to_remote(&self) -> Result<SyncReport> {
        self.registry.sync_local_to_remote().await
    }

    /// Create a remote experiment. See [`ExperimentRegistry::create_experiment`].
    #[allow(clippy::missing_errors_doc)]
    pub async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.registry.create_experiment(experiment).await
    }

    /// Replace a remote experiment. See [`ExperimentRegistry::update_experiment`].
    #[allow(clippy::missing_errors_doc)]
    pub async fn update_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.registry.update_experiment(experiment).await
    }

    /// Delete a remote experiment. See [`ExperimentRegistry::delete_experiment`].
    #[allow(clippy::missing_errors_doc)]
    pub async fn delete_experiment(&self, id: &str) -> Result<()> {
        self.registry.delete_experiment(id).await
    }

    /// Subscribe to live registry updates from the remote store.
    pub async fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Experiment]) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback).await
    }

    /// Current sync mode.
    pub async fn mode(&self) -> SyncMode {
        self.registry.mode().await
    }

    /// Experiments active right now (a copy).
    #[must_use]
    pub fn active_experiments(&self) -> Vec<Experiment> {
        self.registry.active()
    }

    /// Look up an experiment in the registry.
    #[must_use]
    pub fn experiment(&self, id: &str) -> Option<Experiment> {
        self.registry.get(id)
    }

    /// The registry, for dashboards and admin tooling.
    #[must_use]
    pub const fn registry(&self) -> &ExperimentRegistry<S, R> {
        &self.registry
    }

    /// Events in the local log, oldest first.
    pub async fn events(&self) -> Vec<Event> {
        self.tracker.log().events().await
    }

    /// Drop every local event.
    ///
    /// # Errors
    ///
    /// Returns the store error if the persisted log cannot be deleted.
    pub async fn clear_events(&self) -> Result<()> {
        self.tracker.log().clear().await
    }

    /// Per-variant views, conversions and conversion rate for every
    /// experiment in the registry.
    pub async fn report(&self) -> Vec<ExperimentReport> {
        let events = self.events().await;
        summarize(&events, &self.registry.snapshot())
    }
}

/// Builder for [`ExperimentService`]. Store and remote types change as
/// they are set.
pub struct ExperimentServiceBuilder<S: KvStore = MemoryKvStore, R: RemoteStore = MemoryRemoteStore>
{
    config: ServiceConfig,
    baseline: Vec<Experiment>,
    store: Arc<S>,
    remote: Option<Arc<R>>,
}

impl Default for ExperimentServiceBuilder {
    fn default() -> Self {
        Self {
            config: ServiceConfig::default(),
            baseline: Vec::new(),
            store: Arc::new(MemoryKvStore::new()),
            remote: None,
        }
    }
}

impl<S: KvStore, R: RemoteStore> ExperimentServiceBuilder<S, R> {
    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the compiled-in baseline experiments.
    #[must_use]
    pub fn baseline(mut self, baseline: Vec<Experiment>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Use `store` for local persistence.
    #[must_use]
    pub fn store<S2: KvStore>(self, store: S2) -> ExperimentServiceBuilder<S2, R> {
        self.shared_store(Arc::new(store))
    }

    /// Use a shared store for local persistence.
    #[must_use]
    pub fn shared_store<S2: KvStore>(self, store: Arc<S2>) -> ExperimentServiceBuilder<S2, R> {
        ExperimentServiceBuilder {
            config: self.config,
            baseline: self.baseline,
            store,
            remote: self.remote,
        }
    }

    /// Use `remote` as the remote authority and event sink.
    #[must_use]
    pub fn remote<R2: RemoteStore>(self, remote: R2) -> ExperimentServiceBuilder<S, R2> {
        self.shared_remote(Arc::new(remote))
    }

    /// Use a shared remote authority and event sink.
    #[must_use]
    pub fn shared_remote<R2: RemoteStore>(self, remote: Arc<R2>) -> ExperimentServiceBuilder<S, R2> {
        ExperimentServiceBuilder {
            config: self.config,
            baseline: self.baseline,
            store: self.store,
            remote: Some(remote),
        }
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the baseline is malformed or has
    /// duplicate ids.
    pub fn build(self) -> Result<ExperimentService<S, R>> {
        let config = self.config;
        let registry = ExperimentRegistry::new(
            self.baseline,
            Arc::clone(&self.store),
            self.remote.clone(),
            &config,
        )?;
        let identity = IdentityManager::new(Arc::clone(&self.store), config.key("identity"));
        let assignments = AssignmentStore::new(Arc::clone(&self.store), config.key("assignments"));
        let log = EventLog::new(
            Arc::clone(&self.store),
            config.key("events"),
            config.event_log_capacity,
        );
        let tracker = EventTracker::new(log, self.remote, config.remote_timeout());

        Ok(ExperimentService {
            config,
            identity,
            registry,
            assignments,
            tracker,
            live: Mutex::new(None),
        })
    }
}
