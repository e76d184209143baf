//! Boundary with the orchestration platform.
//!
//! The reconciler only needs five operations from the cluster. They are
//! expressed as the [`Platform`] trait so the loop can be driven by the real
//! Kubernetes API ([`KubePlatform`]) or by an in-memory fake in tests.

use crate::config::JobTemplateConfig;
use crate::dataset::WatchedConfig;
use crate::error::{is_api_status, Error, Result, SubmissionError};
use crate::fingerprint::Fingerprint;
use crate::job::{build_job, fingerprint_selector, TaskSpec};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Annotation that makes the Deployment controller roll its pods.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
/// Audit annotation naming the task whose model triggered the rollout.
pub const MODEL_TASK_ANNOTATION: &str = "ml-watcher.5dlabs.com/model-task";

/// Status of a regeneration task as reported by the batch executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The task no longer exists (never created, or garbage-collected).
    NotFound,
}

impl TaskState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::NotFound => write!(f, "not-found"),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Read the watched configuration; `None` when the object does not exist.
    async fn get_config(&self, name: &str) -> Result<Option<WatchedConfig>>;

    /// Create a one-shot regeneration task. Fails without side effects on a name collision.
    async fn create_task(&self, spec: &TaskSpec) -> Result<()>;

    async fn task_status(&self, name: &str) -> Result<TaskState>;

    /// Most recent task already created for `fingerprint`, if any.
    async fn find_task(&self, fingerprint: &Fingerprint) -> Result<Option<(String, TaskState)>>;

    /// Ask the dependent service to roll its instances. Idempotent.
    async fn trigger_restart(&self, service: &str, task: &str) -> Result<()>;
}

/// [`Platform`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    namespace: String,
    template: JobTemplateConfig,
}

impl KubePlatform {
    pub fn new(client: Client, namespace: &str, template: JobTemplateConfig) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            template,
        }
    }

    fn configmaps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_config(&self, name: &str) -> Result<Option<WatchedConfig>> {
        match self.configmaps().get(name).await {
            Ok(cm) => Ok(Some(WatchedConfig::new(
                name,
                cm.namespace().unwrap_or_else(|| self.namespace.clone()),
                cm.data.unwrap_or_default(),
            ))),
            Err(e) if is_api_status(&e, 404) => Ok(None),
            Err(e) => Err(Error::ConfigRead {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn create_task(&self, spec: &TaskSpec) -> Result<()> {
        let job = build_job(spec, &self.template);
        match self.jobs().create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(task = %spec.name, "Created regeneration job");
                Ok(())
            }
            Err(e) if is_api_status(&e, 409) => {
                Err(SubmissionError::NameCollision(spec.name.clone()).into())
            }
            Err(e) => Err(SubmissionError::Rejected {
                name: spec.name.clone(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    async fn task_status(&self, name: &str) -> Result<TaskState> {
        match self.jobs().get(name).await {
            Ok(job) => Ok(job_state(&job)),
            Err(e) if is_api_status(&e, 404) => Ok(TaskState::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_task(&self, fingerprint: &Fingerprint) -> Result<Option<(String, TaskState)>> {
        let params = ListParams::default().labels(&fingerprint_selector(fingerprint));
        let jobs = self.jobs().list(&params).await?;

        let newest = jobs
            .items
            .into_iter()
            .max_by_key(|job| job.metadata.creation_timestamp.clone().map(|t| t.0));

        Ok(newest.map(|job| {
            let state = job_state(&job);
            debug!(task = %job.name_any(), %state, "Found existing job for fingerprint");
            (job.name_any(), state)
        }))
    }

    async fn trigger_restart(&self, service: &str, task: &str) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339(),
                            MODEL_TASK_ANNOTATION: task,
                        }
                    }
                }
            }
        });

        self.deployments()
            .patch(service, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::RestartTrigger {
                service: service.to_string(),
                attempts: 1,
                message: e.to_string(),
            })?;

        info!(%service, %task, "Patched deployment for rolling restart");
        Ok(())
    }
}

/// Run a platform call with a deadline; an elapsed deadline becomes [`Error::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout { operation, timeout })?
}

/// Backoff limit the API server applies when the Job spec leaves it unset.
const DEFAULT_BACKOFF_LIMIT: i32 = 6;

fn job_state(job: &Job) -> TaskState {
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|spec| spec.backoff_limit)
        .unwrap_or(DEFAULT_BACKOFF_LIMIT);
    job.status
        .as_ref()
        .map_or(TaskState::Pending, |status| {
            determine_job_state(status, backoff_limit)
        })
}

/// Map a Job status onto the task state machine.
///
/// Failed pods only make the task terminal once no pod is active and the
/// retries allowed by `backoff_limit` are used up.
pub fn determine_job_state(status: &JobStatus, backoff_limit: i32) -> TaskState {
    // Check completion conditions first
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.type_ == "Complete" && condition.status == "True" {
                return TaskState::Succeeded;
            }
            if condition.type_ == "Failed" && condition.status == "True" {
                return TaskState::Failed;
            }
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        return TaskState::Succeeded;
    }
    let active = status.active.unwrap_or(0);
    if active == 0 && status.failed.unwrap_or(0) > backoff_limit {
        return TaskState::Failed;
    }

    if active > 0 || status.start_time.is_some() {
        TaskState::Running
    } else {
        TaskState::Pending
    }
}
