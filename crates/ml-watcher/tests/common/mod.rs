#![allow(dead_code)]

//! In-memory platform double shared by the integration tests.

use async_trait::async_trait;
use ml_watcher::config::RestartConfig;
use ml_watcher::state::PersistedState;
use ml_watcher::{
    Error, Fingerprint, Platform, Reconciler, Result, StateStore, SubmissionError, TaskSpec,
    TaskState, WatchedConfig, WatcherConfig,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

pub const SERVICE: &str = "recommender-api";
pub const CONFIG_MAP: &str = "ml-dataset-config";

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[derive(Debug, Clone)]
pub struct FakeJob {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub dataset: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestartCall {
    pub service: String,
    pub task: String,
    /// State of the task's job when the restart was issued.
    pub job_state: Option<TaskState>,
}

#[derive(Default)]
struct Inner {
    config: Option<BTreeMap<String, String>>,
    config_unreachable: bool,
    jobs: Vec<FakeJob>,
    create_calls: usize,
    create_failures: u32,
    restart_failures: u32,
    restarts: Vec<RestartCall>,
}

#[derive(Default)]
pub struct FakePlatform {
    inner: Mutex<Inner>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_dataset(&self, name: &str) {
        self.set_data(&[
            ("DATASET_URL", &format!("/datasets/2023_spotify_{name}.csv")),
            ("DATASET_NAME", name),
            ("MODEL_FILENAME", &format!("rules_{name}.pkl")),
        ]);
    }

    pub fn set_data(&self, pairs: &[(&str, &str)]) {
        let data = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.inner.lock().unwrap().config = Some(data);
    }

    pub fn remove_config(&self) {
        self.inner.lock().unwrap().config = None;
    }

    pub fn set_config_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().config_unreachable = unreachable;
    }

    /// Fail the next `n` create calls with a transient rejection.
    pub fn fail_next_creates(&self, n: u32) {
        self.inner.lock().unwrap().create_failures = n;
    }

    /// Fail the next `n` restart calls.
    pub fn fail_next_restarts(&self, n: u32) {
        self.inner.lock().unwrap().restart_failures = n;
    }

    pub fn set_state(&self, name: &str, state: TaskState) {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.name == name)
            .unwrap_or_else(|| panic!("no job {name}"));
        job.state = state;
    }

    /// Simulate TTL garbage collection.
    pub fn delete_job(&self, name: &str) {
        self.inner.lock().unwrap().jobs.retain(|j| j.name != name);
    }

    /// Insert a job as if it had been created by an earlier process.
    pub fn insert_job(&self, name: &str, dataset: &str, fingerprint: Fingerprint, state: TaskState) {
        self.inner.lock().unwrap().jobs.push(FakeJob {
            name: name.to_string(),
            fingerprint,
            dataset: dataset.to_string(),
            state,
        });
    }

    pub fn jobs(&self) -> Vec<FakeJob> {
        self.inner.lock().unwrap().jobs.clone()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs().into_iter().map(|j| j.name).collect()
    }

    pub fn create_calls(&self) -> usize {
        self.inner.lock().unwrap().create_calls
    }

    pub fn restarts(&self) -> Vec<RestartCall> {
        self.inner.lock().unwrap().restarts.clone()
    }

    pub fn restarts_for(&self, task: &str) -> usize {
        self.restarts().iter().filter(|r| r.task == task).count()
    }

    /// Fingerprint of the config currently stored.
    pub fn current_fingerprint(&self) -> Fingerprint {
        let data = self.inner.lock().unwrap().config.clone().unwrap_or_default();
        let params = WatchedConfig::new(CONFIG_MAP, "ml", data).params().unwrap();
        Fingerprint::of(&params)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn get_config(&self, name: &str) -> Result<Option<WatchedConfig>> {
        let inner = self.inner.lock().unwrap();
        if inner.config_unreachable {
            return Err(Error::ConfigRead {
                name: name.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(inner
            .config
            .clone()
            .map(|data| WatchedConfig::new(name, "ml", data)))
    }

    async fn create_task(&self, spec: &TaskSpec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_calls += 1;
        if inner.create_failures > 0 {
            inner.create_failures -= 1;
            return Err(SubmissionError::Rejected {
                name: spec.name.clone(),
                reason: "exceeded quota".to_string(),
            }
            .into());
        }
        if inner.jobs.iter().any(|j| j.name == spec.name) {
            return Err(SubmissionError::NameCollision(spec.name.clone()).into());
        }
        inner.jobs.push(FakeJob {
            name: spec.name.clone(),
            fingerprint: spec.fingerprint.clone(),
            dataset: spec.params.dataset_name.clone(),
            state: TaskState::Pending,
        });
        Ok(())
    }

    async fn task_status(&self, name: &str) -> Result<TaskState> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .find(|j| j.name == name)
            .map_or(TaskState::NotFound, |j| j.state))
    }

    async fn find_task(&self, fingerprint: &Fingerprint) -> Result<Option<(String, TaskState)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .rev()
            .find(|j| &j.fingerprint == fingerprint)
            .map(|j| (j.name.clone(), j.state)))
    }

    async fn trigger_restart(&self, service: &str, task: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.restart_failures > 0 {
            inner.restart_failures -= 1;
            return Err(Error::RestartTrigger {
                service: service.to_string(),
                attempts: 1,
                message: "deployment patch refused".to_string(),
            });
        }
        let job_state = inner.jobs.iter().find(|j| j.name == task).map(|j| j.state);
        inner.restarts.push(RestartCall {
            service: service.to_string(),
            task: task.to_string(),
            job_state,
        });
        Ok(())
    }
}

/// State store kept in memory, standing in for the `ConfigMap` store.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<PersistedState>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Option<PersistedState> {
        self.saved.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.saved.lock().unwrap().clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        *self.saved.lock().unwrap() = Some(state.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

pub fn test_config() -> WatcherConfig {
    let mut config = WatcherConfig::default();
    config.job.image = "ghcr.io/5dlabs/rules-generator:test".to_string();
    config.poll_interval_seconds = 1;
    config.api_timeout_seconds = 5;
    config.restart = RestartConfig {
        max_attempts: 2,
        initial_backoff_millis: 1,
        max_backoff_millis: 2,
    };
    config
}

pub fn reconciler(platform: &Arc<FakePlatform>) -> Reconciler {
    init_tracing();
    Reconciler::new(&test_config(), platform.clone(), None)
}

pub fn persistent_reconciler(platform: &Arc<FakePlatform>, store: &Arc<MemoryStore>) -> Reconciler {
    init_tracing();
    Reconciler::new(&test_config(), platform.clone(), Some(store.clone() as Arc<dyn StateStore>))
}
