//! Watcher state.
//!
//! The change marker and the outstanding-task set live in a single
//! [`WatcherState`] guarded by one async mutex ([`SharedState`]), so the
//! reconcile step, the completion watcher and the HTTP status endpoint can
//! never observe a half-applied update. A [`StateStore`] optionally persists a
//! snapshot across process restarts, following the `ConfigMap`-backed state
//! pattern used by the remediation loop.

use crate::error::{is_api_status, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Recent outcomes kept for the status endpoint.
pub const MAX_RECENT_OUTCOMES: usize = 50;

const STATE_KEY: &str = "state.json";

pub type SharedState = Arc<Mutex<WatcherState>>;

/// A submitted regeneration task awaiting a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutstandingTask {
    pub name: String,
    pub dataset: String,
    pub fingerprint: Fingerprint,
    pub registered_at: DateTime<Utc>,
    /// The task succeeded but its restart has not gone through yet.
    #[serde(default)]
    pub restart_pending: bool,
}

/// Terminal observation reported by the completion watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    /// Succeeded and the dependent service was restarted.
    Restarted,
    /// Worker exited non-zero; no restart.
    Failed,
    /// Disappeared before a terminal state was observed; no restart.
    Unknown,
    /// Succeeded but the restart could not be triggered yet.
    RestartFailed,
    /// Tick-level error (config read, submission).
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub at: DateTime<Utc>,
    pub kind: OutcomeKind,
    pub task: Option<String>,
    pub message: String,
}

/// Process-wide reconciler state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherState {
    /// Fingerprint of the last configuration a task was submitted (or adopted) for.
    pub last_fingerprint: Option<Fingerprint>,
    /// Task created for `last_fingerprint`.
    pub last_task: Option<String>,
    pub handled_at: Option<DateTime<Utc>>,
    pub outstanding: BTreeMap<String, OutstandingTask>,
    #[serde(default)]
    pub recent: VecDeque<Outcome>,
    #[serde(default)]
    pub ticks: u64,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl WatcherState {
    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Whether `fingerprint` was already handled.
    pub fn is_handled(&self, fingerprint: &Fingerprint) -> bool {
        self.last_fingerprint.as_ref() == Some(fingerprint)
    }

    /// Advance the marker after a successful submission or adoption.
    pub fn mark_handled(&mut self, fingerprint: Fingerprint, task: &str) {
        self.last_fingerprint = Some(fingerprint);
        self.last_task = Some(task.to_string());
        self.handled_at = Some(Utc::now());
    }

    /// Forget the marker so the next tick re-submits for the current config.
    pub fn clear_marker(&mut self) {
        self.last_fingerprint = None;
        self.last_task = None;
        self.handled_at = None;
    }

    pub fn register(&mut self, task: OutstandingTask) {
        self.outstanding.insert(task.name.clone(), task);
    }

    pub fn record(&mut self, kind: OutcomeKind, task: Option<&str>, message: impl Into<String>) {
        if self.recent.len() >= MAX_RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back(Outcome {
            at: Utc::now(),
            kind,
            task: task.map(str::to_string),
            message: message.into(),
        });
    }

    /// Snapshot of what survives a restart: the marker and the outstanding set.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            last_fingerprint: self.last_fingerprint.clone(),
            last_task: self.last_task.clone(),
            handled_at: self.handled_at,
            outstanding: self.outstanding.values().cloned().collect(),
        }
    }

    /// Replace the marker and outstanding set with a persisted snapshot.
    ///
    /// Outcomes and tick counters are process-local and kept as they are.
    pub fn apply_persisted(&mut self, persisted: PersistedState) {
        self.last_fingerprint = persisted.last_fingerprint;
        self.last_task = persisted.last_task;
        self.handled_at = persisted.handled_at;
        self.outstanding = persisted
            .outstanding
            .into_iter()
            .map(|task| (task.name.clone(), task))
            .collect();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub last_fingerprint: Option<Fingerprint>,
    pub last_task: Option<String>,
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outstanding: Vec<OutstandingTask>,
}

/// Durable storage for the change marker.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedState>>;
    async fn save(&self, state: &PersistedState) -> Result<()>;
}

/// [`StateStore`] that keeps the snapshot in a `ConfigMap`.
pub struct ConfigMapStateStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapStateStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl StateStore for ConfigMapStateStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        match self.configmaps.get(&self.name).await {
            Ok(cm) => {
                let Some(state_json) = cm.data.as_ref().and_then(|d| d.get(STATE_KEY)) else {
                    warn!("ConfigMap {} missing {} data", self.name, STATE_KEY);
                    return Ok(None);
                };
                let state: PersistedState = serde_json::from_str(state_json)?;
                debug!("Loaded watcher state from ConfigMap {}", self.name);
                Ok(Some(state))
            }
            Err(e) if is_api_status(&e, 404) => {
                debug!("No persisted watcher state found in {}", self.name);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        let state_json = serde_json::to_string_pretty(state)?;

        let mut data = BTreeMap::new();
        data.insert(STATE_KEY.to_string(), state_json);
        if let Some(fp) = &state.last_fingerprint {
            data.insert("fingerprint".to_string(), fp.to_string());
        }
        data.insert("updated_at".to_string(), Utc::now().to_rfc3339());

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "ml-watcher".to_string()),
                    ("component".to_string(), "state-store".to_string()),
                ])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        // Try to create first, then patch if it exists
        match self.configmaps.create(&PostParams::default(), &cm).await {
            Ok(_) => debug!("Created state ConfigMap {}", self.name),
            Err(e) if is_api_status(&e, 409) => {
                let patch = serde_json::json!({ "data": cm.data });
                self.configmaps
                    .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!("Updated state ConfigMap {}", self.name);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
