//! Completion watcher.
//!
//! Polls every outstanding regeneration task and acts on terminal states:
//! success restarts the dependent service, failure and disappearance are
//! reported without a restart. Network calls run without holding the state
//! lock; only the resulting mutations are applied under it.

use crate::error::Error;
use crate::platform::{bounded, Platform, TaskState};
use crate::restart::RestartTrigger;
use crate::state::{OutcomeKind, OutstandingTask, SharedState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// What the watcher concluded about one outstanding task during a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Succeeded and the dependent service restart went through.
    Restarted { task: String, attempts: u32 },
    /// Worker failed; dropped without restart.
    Failed { task: String },
    /// Gone before a terminal state was seen; dropped without restart.
    Unknown { task: String },
    /// Succeeded but the restart is still failing; kept for the next tick.
    RestartFailed { task: String, error: String },
    /// Pending or Running; re-checked next tick.
    StillActive { task: String, state: TaskState },
    /// The status query itself failed; re-checked next tick.
    QueryFailed { task: String, error: String },
}

impl Observation {
    /// Whether the observation changed the outstanding set or a task flag.
    pub fn mutates_state(&self) -> bool {
        !matches!(self, Self::StillActive { .. } | Self::QueryFailed { .. })
    }
}

pub struct CompletionWatcher {
    platform: Arc<dyn Platform>,
    restarts: Arc<RestartTrigger>,
    service: String,
    call_timeout: Duration,
}

impl CompletionWatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        restarts: Arc<RestartTrigger>,
        service: &str,
        call_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            restarts,
            service: service.to_string(),
            call_timeout,
        }
    }

    /// Check every outstanding task once.
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn poll(&self, state: &SharedState) -> Vec<Observation> {
        let tasks: Vec<OutstandingTask> = {
            let guard = state.lock().await;
            guard.outstanding.values().cloned().collect()
        };

        let mut observations = Vec::with_capacity(tasks.len());
        for task in tasks {
            let observation = self.observe(&task).await;
            self.apply(state, &task, &observation).await;
            observations.push(observation);
        }
        observations
    }

    async fn observe(&self, task: &OutstandingTask) -> Observation {
        let status = if task.restart_pending {
            // the job already succeeded; only the restart is owed
            TaskState::Succeeded
        } else {
            let call = self.platform.task_status(&task.name);
            match bounded("task status", self.call_timeout, call).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(task = %task.name, error = %e, "Failed to query task status");
                    return Observation::QueryFailed {
                        task: task.name.clone(),
                        error: e.to_string(),
                    };
                }
            }
        };

        match status {
            TaskState::Succeeded => match self.restarts.restart(&self.service, &task.name).await {
                Ok(attempts) => Observation::Restarted {
                    task: task.name.clone(),
                    attempts,
                },
                Err(e) => {
                    error!(task = %task.name, error = %e, "Model regenerated but restart failed");
                    Observation::RestartFailed {
                        task: task.name.clone(),
                        error: e.to_string(),
                    }
                }
            },
            TaskState::Failed => {
                let failure = Error::TaskExecution {
                    name: task.name.clone(),
                    message: format!("worker for dataset {} exited non-zero", task.dataset),
                };
                error!(task = %task.name, error = %failure, "Regeneration failed, keeping current model");
                Observation::Failed {
                    task: task.name.clone(),
                }
            }
            TaskState::NotFound => {
                warn!(
                    task = %task.name,
                    "Task disappeared before a terminal state was observed"
                );
                Observation::Unknown {
                    task: task.name.clone(),
                }
            }
            active @ (TaskState::Pending | TaskState::Running) => {
                debug!(task = %task.name, state = %active, "Task still in progress");
                Observation::StillActive {
                    task: task.name.clone(),
                    state: active,
                }
            }
        }
    }

    async fn apply(&self, state: &SharedState, task: &OutstandingTask, observation: &Observation) {
        let mut guard = state.lock().await;
        match observation {
            Observation::Restarted { task: name, attempts } => {
                guard.outstanding.remove(name);
                guard.record(
                    OutcomeKind::Restarted,
                    Some(name),
                    format!(
                        "model for {} ready, {} restarted after {} attempt(s)",
                        task.dataset, self.service, attempts
                    ),
                );
                info!(task = %name, service = %self.service, "Regeneration completed");
            }
            Observation::Failed { task: name } => {
                guard.outstanding.remove(name);
                guard.record(
                    OutcomeKind::Failed,
                    Some(name),
                    format!("regeneration for {} failed; no restart", task.dataset),
                );
            }
            Observation::Unknown { task: name } => {
                guard.outstanding.remove(name);
                guard.record(
                    OutcomeKind::Unknown,
                    Some(name),
                    "task not found before completion was observed; no restart",
                );
            }
            Observation::RestartFailed { task: name, error } => {
                if let Some(entry) = guard.outstanding.get_mut(name) {
                    entry.restart_pending = true;
                }
                guard.record(OutcomeKind::RestartFailed, Some(name), error.clone());
            }
            Observation::StillActive { .. } | Observation::QueryFailed { .. } => {}
        }
    }
}
