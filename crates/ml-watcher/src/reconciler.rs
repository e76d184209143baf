//! Reconciler loop.
//!
//! Each tick reads the watched `ConfigMap`, fingerprints the regeneration
//! parameters and, when the fingerprint differs from the change marker,
//! submits exactly one uniquely named regeneration Job. The marker only moves
//! after the submission succeeded, so a failed submission is retried on the
//! next tick against the same target. The completion watcher then runs in the
//! same tick.

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::job::TaskSpec;
use crate::naming::JobNamer;
use crate::platform::{bounded, Platform, TaskState};
use crate::restart::RestartTrigger;
use crate::state::{OutcomeKind, OutstandingTask, SharedState, StateStore, WatcherState};
use crate::watcher::{CompletionWatcher, Observation};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of the reconcile step of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Fingerprint matches the marker; nothing submitted.
    Unchanged { fingerprint: Fingerprint },
    /// A new regeneration task was created.
    Submitted {
        task: String,
        fingerprint: Fingerprint,
    },
    /// An active task for this fingerprint already existed and was registered instead.
    Adopted {
        task: String,
        fingerprint: Fingerprint,
        state: TaskState,
    },
}

/// Everything one tick did, for logging and tests.
#[derive(Debug)]
pub struct TickReport {
    pub action: Result<ReconcileAction>,
    pub observations: Vec<Observation>,
}

pub struct Reconciler {
    platform: Arc<dyn Platform>,
    watcher: CompletionWatcher,
    namer: JobNamer,
    state: SharedState,
    store: Option<Arc<dyn StateStore>>,
    watched_config_map: String,
    namespace: String,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        config: &WatcherConfig,
        platform: Arc<dyn Platform>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let restarts = Arc::new(RestartTrigger::new(
            Arc::clone(&platform),
            config.restart.clone(),
            config.api_timeout(),
        ));
        let watcher = CompletionWatcher::new(
            Arc::clone(&platform),
            restarts,
            &config.dependent_deployment,
            config.api_timeout(),
        );

        Self {
            platform,
            watcher,
            namer: JobNamer::new(),
            state: WatcherState::default().shared(),
            store,
            watched_config_map: config.watched_config_map.clone(),
            namespace: config.namespace.clone(),
            poll_interval: config.poll_interval(),
            call_timeout: config.api_timeout(),
        }
    }

    /// Handle to the shared state, for the status server.
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Load the persisted marker, if a store is configured and holds one.
    ///
    /// A loaded snapshot replaces the in-memory marker and outstanding set.
    pub async fn restore(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(persisted) = bounded("load state", self.call_timeout, store.load()).await? else {
            info!("No persisted state; current config will be treated as new");
            return Ok(false);
        };

        info!(
            fingerprint = ?persisted.last_fingerprint.as_ref().map(Fingerprint::short),
            outstanding = persisted.outstanding.len(),
            "Restored persisted watcher state"
        );
        self.state.lock().await.apply_persisted(persisted);
        Ok(true)
    }

    /// Refresh state from the store before a leadership term starts ticking.
    ///
    /// With a store configured, a failed load starts cold rather than acting
    /// on whatever an earlier term left in memory.
    async fn refresh_for_term(&self) {
        if let Err(e) = self.restore().await {
            warn!(error = %e, "Failed to restore persisted state, starting cold");
            let mut state = self.state.lock().await;
            state.clear_marker();
            state.outstanding.clear();
        }
    }

    /// Operator-forced re-submission: forget the marker so the next tick submits again.
    pub async fn request_resubmit(&self) {
        self.state.lock().await.clear_marker();
        info!("Change marker cleared; next tick re-submits for the current config");
        self.persist().await;
    }

    /// Steps 1-5 of a tick: read, fingerprint, compare, submit, mark.
    #[instrument(skip(self), fields(config_map = %self.watched_config_map))]
    pub async fn reconcile(&self) -> Result<ReconcileAction> {
        let call = self.platform.get_config(&self.watched_config_map);
        let watched = bounded("read config", self.call_timeout, call)
            .await?
            .ok_or_else(|| Error::ConfigRead {
                name: self.watched_config_map.clone(),
                message: "not found".to_string(),
            })?;

        let params = watched.params()?;
        let fingerprint = Fingerprint::of(&params);

        if self.state.lock().await.is_handled(&fingerprint) {
            debug!(fingerprint = %fingerprint.short(), "Config unchanged");
            return Ok(ReconcileAction::Unchanged { fingerprint });
        }

        info!(
            fingerprint = %fingerprint.short(),
            dataset = %params.dataset_name,
            "Config change detected"
        );

        // A task for this fingerprint may already be running if a previous
        // submission went through but was never recorded.
        let call = self.platform.find_task(&fingerprint);
        if let Some((task, state)) = bounded("find task", self.call_timeout, call).await? {
            if state.is_active() {
                self.mark_and_register(&fingerprint, &task, &params.dataset_name)
                    .await;
                info!(%task, %state, "Adopted existing regeneration task");
                return Ok(ReconcileAction::Adopted {
                    task,
                    fingerprint,
                    state,
                });
            }
            debug!(%task, %state, "Existing task for fingerprint is terminal; submitting a new one");
        }

        let spec = TaskSpec {
            name: self.namer.next_name(&params.dataset_name),
            namespace: self.namespace.clone(),
            fingerprint: fingerprint.clone(),
            params,
        };

        let call = self.platform.create_task(&spec);
        bounded("create task", self.call_timeout, call).await?;

        self.mark_and_register(&fingerprint, &spec.name, &spec.params.dataset_name)
            .await;
        info!(task = %spec.name, fingerprint = %fingerprint.short(), "Submitted regeneration task");

        Ok(ReconcileAction::Submitted {
            task: spec.name,
            fingerprint,
        })
    }

    async fn mark_and_register(&self, fingerprint: &Fingerprint, task: &str, dataset: &str) {
        {
            let mut state = self.state.lock().await;
            state.mark_handled(fingerprint.clone(), task);
            if !state.outstanding.contains_key(task) {
                state.register(OutstandingTask {
                    name: task.to_string(),
                    dataset: dataset.to_string(),
                    fingerprint: fingerprint.clone(),
                    registered_at: Utc::now(),
                    restart_pending: false,
                });
            }
        }
        self.persist().await;
    }

    /// Save the marker snapshot; failures are logged, never fatal.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.state.lock().await.persisted();
        if let Err(e) = bounded("save state", self.call_timeout, store.save(&snapshot)).await {
            warn!(error = %e, "Failed to persist watcher state");
        }
    }

    /// One full tick: reconcile, then poll outstanding tasks.
    pub async fn tick(&self) -> TickReport {
        let action = self.reconcile().await;

        if let Err(e) = &action {
            error!(kind = e.kind(), error = %e, "Reconcile step failed; retrying next tick");
            self.state
                .lock()
                .await
                .record(OutcomeKind::Error, None, e.to_string());
        }

        let observations = self.watcher.poll(&self.state).await;
        if observations.iter().any(Observation::mutates_state) {
            self.persist().await;
        }

        {
            let mut state = self.state.lock().await;
            state.ticks += 1;
            state.last_tick_at = Some(Utc::now());
        }

        TickReport {
            action,
            observations,
        }
    }

    /// Tick on the poll interval until `shutdown` is cancelled.
    ///
    /// Persisted state is reloaded on entry, so every leadership term starts
    /// from what the previous writer saved. Cancellation is only observed
    /// between ticks, so a submitted task is always registered before the
    /// loop exits.
    #[instrument(skip_all, fields(interval = ?self.poll_interval))]
    pub async fn run(&self, shutdown: CancellationToken) {
        self.refresh_for_term().await;
        info!("Reconciler loop started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Reconciler loop stopped");
    }
}
