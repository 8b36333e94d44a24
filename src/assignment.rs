//! Persisted identity → (experiment → variant) assignments
//!
//! Assignments are computed lazily and served from cache until `reset_all`
//! or a variant layout change ([`Experiment::fingerprint`]). A missing,
//! corrupt or foreign payload is treated as empty and rewritten.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bucketing;
use crate::experiment::Experiment;
use crate::kv::KvStore;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredAssignment {
    variant: String,
    fingerprint: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedAssignments {
    identity: String,
    assignments: BTreeMap<String, StoredAssignment>,
}

/// Result of resolving assignments against the active experiments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentOutcome {
    /// `test_id → variant_id` for exactly the active experiments.
    pub assignments: BTreeMap<String, String>,
    /// `(test_id, variant_id)` pairs computed by this call.
    pub newly_assigned: Vec<(String, String)>,
}

/// Cache of assignments for the installation identity.
pub struct AssignmentStore<S: KvStore> {
    store: Arc<S>,
    key: String,
    cache: Mutex<Option<PersistedAssignments>>,
}

impl<S: KvStore> AssignmentStore<S> {
    /// Create a store persisting under `key`.
    #[must_use]
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            cache: Mutex::new(None),
        }
    }

    /// Load the persisted payload for `identity`. The flag is true when the
    /// persisted state must be overwritten.
    async fn load(&self, identity: &str) -> (PersistedAssignments, bool) {
        let fresh = || PersistedAssignments {
            identity: identity.to_string(),
            assignments: BTreeMap::new(),
        };
        match self.store.get_json::<PersistedAssignments>(&self.key).await {
            Ok(Some(persisted)) if persisted.identity == identity => (persisted, false),
            Ok(Some(_)) => {
                tracing::debug!("assignment cache belongs to another identity; recomputing");
                (fresh(), true)
            }
            Ok(None) => (fresh(), false),
            Err(error) => {
                tracing::warn!(%error, "assignment cache unreadable; recomputing");
                (fresh(), true)
            }
        }
    }

    async fn persist(&self, payload: &PersistedAssignments) {
        if let Err(error) = self.store.set_json(&self.key, payload).await {
            tracing::warn!(%error, "assignment cache not persisted");
        }
    }

    /// Make sure the cache holds the payload for `identity`. Returns true
    /// when the persisted state must be overwritten.
    async fn ensure_loaded(
        &self,
        cache: &mut Option<PersistedAssignments>,
        identity: &str,
    ) -> bool {
        if cache.as_ref().is_some_and(|cached| cached.identity == identity) {
            return false;
        }
        let (loaded, needs_persist) = self.load(identity).await;
        *cache = Some(loaded);
        needs_persist
    }

    /// The existing assignment for `test_id`, without bucketing.
    ///
    /// `None` if the experiment is not in `active`, nothing has been
    /// assigned yet, or the stored assignment predates a layout change.
    pub async fn current(
        &self,
        identity: &str,
        test_id: &str,
        active: &[Experiment],
    ) -> Option<String> {
        let experiment = active.iter().find(|exp| exp.id() == test_id)?;
        let mut guard = self.cache.lock().await;
        self.ensure_loaded(&mut *guard, identity).await;
        let variant = guard
            .as_ref()?
            .assignments
            .get(test_id)
            .filter(|stored| {
                stored.fingerprint == experiment.fingerprint()
                    && experiment.variant(&stored.variant).is_some()
            })
            .map(|stored| stored.variant.clone());
        variant
    }

    /// Resolve assignments for every active experiment, computing and
    /// persisting any that are missing or stale. The write completes before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns `Error::Assignment` if an active experiment has no variants.
    /// No assignment is cached or persisted in that case.
    pub async fn get_assignments(
        &self,
        identity: &str,
        active: &[Experiment],
    ) -> Result<AssignmentOutcome> {
        let mut guard = self.cache.lock().await;
        let mut dirty = self.ensure_loaded(&mut *guard, identity).await;
        let cache = guard.get_or_insert_with(PersistedAssignments::default);

        // Resolve everything before touching the cache so a failure leaves
        // it unchanged.
        let mut resolved = Vec::with_capacity(active.len());
        for experiment in active {
            let fingerprint = experiment.fingerprint();
            let cached = cache
                .assignments
                .get(experiment.id())
                .filter(|stored| {
                    stored.fingerprint == fingerprint
                        && experiment.variant(&stored.variant).is_some()
                })
                .map(|stored| stored.variant.clone());
            match cached {
                Some(variant) => resolved.push((experiment.id(), variant, None)),
                None => {
                    let variant = bucketing::assign(identity, experiment)?.to_string();
                    resolved.push((experiment.id(), variant, Some(fingerprint)));
                }
            }
        }

        let mut outcome = AssignmentOutcome::default();
        for (test_id, variant, computed) in resolved {
            if let Some(fingerprint) = computed {
                tracing::debug!(%test_id, variant_id = %variant, "assignment computed");
                cache.assignments.insert(
                    test_id.to_string(),
                    StoredAssignment {
                        variant: variant.clone(),
                        fingerprint,
                    },
                );
                outcome
                    .newly_assigned
                    .push((test_id.to_string(), variant.clone()));
                dirty = true;
            }
            outcome.assignments.insert(test_id.to_string(), variant);
        }

        if dirty {
            self.persist(cache).await;
        }
        Ok(outcome)
    }

    /// Clear the persisted cache and recompute every active experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Assignment` if an active experiment has no variants.
    pub async fn reset_all(
        &self,
        identity: &str,
        active: &[Experiment],
    ) -> Result<AssignmentOutcome> {
        {
            let mut guard = self.cache.lock().await;
            if let Err(error) = self.store.delete(&self.key).await {
                tracing::warn!(%error, "assignment cache not cleared on disk");
            }
            *guard = Some(PersistedAssignments {
                identity: identity.to_string(),
                assignments: BTreeMap::new(),
            });
        }
        tracing::info!(count = active.len(), "assignments reset");
        self.get_assignments(identity, active).await
    }
}
