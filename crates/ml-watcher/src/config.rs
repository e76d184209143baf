//! Watcher Configuration
//!
//! Controller configuration loaded from a mounted YAML file, with a handful of
//! environment overrides for the values that differ per deployment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main watcher configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Namespace holding the watched `ConfigMap`, the Jobs and the Deployment
    pub namespace: String,

    /// Name of the `ConfigMap` whose content drives regeneration
    pub watched_config_map: String,

    /// Deployment restarted after a successful regeneration
    pub dependent_deployment: String,

    /// Seconds between reconciliation ticks
    pub poll_interval_seconds: u64,

    /// Upper bound for any single Kubernetes API call
    pub api_timeout_seconds: u64,

    /// Regeneration Job template
    pub job: JobTemplateConfig,

    /// Dependent restart policy
    pub restart: RestartConfig,

    /// Change marker persistence
    pub state: StateConfig,

    /// Single-writer guarantee
    pub leader_election: LeaderElectionConfig,

    /// HTTP status server
    pub server: ServerConfig,
}

/// Regeneration Job template
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobTemplateConfig {
    /// Worker image (e.g., "ghcr.io/5dlabs/rules-generator:latest")
    pub image: String,

    pub image_pull_policy: Option<String>,

    /// Entrypoint; worker arguments are appended after it
    pub command: Vec<String>,

    /// Pod retries before the Job is marked failed
    pub backoff_limit: i32,

    /// Retention window after completion, after which the platform deletes the Job
    pub ttl_seconds_after_finished: i32,

    pub active_deadline_seconds: Option<i64>,

    pub service_account_name: Option<String>,

    /// Shared volume the model file is written to
    pub model_volume: ModelVolumeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelVolumeConfig {
    /// `PersistentVolumeClaim` shared with the serving Deployment
    pub claim_name: String,

    /// Mount path inside the worker container
    pub mount_path: String,
}

/// Restart retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
}

/// Change marker persistence configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateConfig {
    /// Persist the marker and outstanding tasks across restarts
    pub persist: bool,

    /// `ConfigMap` that stores the snapshot
    pub config_map_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub lease_duration_seconds: u64,
    pub renew_interval_seconds: u64,
    /// Holder identity; falls back to the pod hostname
    pub identity: Option<String>,
}

/// Health, status and resubmission endpoints.
///
/// The listener has no authentication or rate limiting and is meant for
/// cluster-internal callers only (probes, operators via port-forward). Keep it
/// off any Ingress, and turn `allowResubmit` off where in-cluster callers
/// must not be able to force regenerations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// Serve `POST /resubmit`
    pub allow_resubmit: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: "ml".to_string(),
            watched_config_map: "ml-dataset-config".to_string(),
            dependent_deployment: "recommender-api".to_string(),
            poll_interval_seconds: 30,
            api_timeout_seconds: 10,
            job: JobTemplateConfig::default(),
            restart: RestartConfig::default(),
            state: StateConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for JobTemplateConfig {
    fn default() -> Self {
        Self {
            image: "MISSING_IMAGE_CONFIG".to_string(),
            image_pull_policy: None,
            command: vec!["python".to_string(), "/app/ruleGenerator.py".to_string()],
            backoff_limit: 0,
            ttl_seconds_after_finished: 3600,
            active_deadline_seconds: None,
            service_account_name: None,
            model_volume: ModelVolumeConfig::default(),
        }
    }
}

impl Default for ModelVolumeConfig {
    fn default() -> Self {
        Self {
            claim_name: "model-pvc".to_string(),
            mount_path: "/models".to_string(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_millis: 1_000,
            max_backoff_millis: 30_000,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            persist: false,
            config_map_name: "ml-watcher-state".to_string(),
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "ml-watcher-leader".to_string(),
            lease_duration_seconds: 30,
            renew_interval_seconds: 10,
            identity: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            allow_resubmit: true,
        }
    }
}

impl JobTemplateConfig {
    /// Returns `true` when the worker image is populated with a real value.
    pub fn is_configured(&self) -> bool {
        let image = self.image.trim();
        !image.is_empty() && image != "MISSING_IMAGE_CONFIG"
    }

    /// Absolute path of a model file on the shared volume
    pub fn model_path(&self, filename: &str) -> String {
        format!("{}/{}", self.model_volume.mount_path.trim_end_matches('/'), filename)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    /// Validate that all required configuration fields are present and usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("watchedConfigMap", &self.watched_config_map),
            ("dependentDeployment", &self.dependent_deployment),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("{field} must not be empty"));
            }
        }

        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("pollIntervalSeconds must be greater than zero"));
        }
        if self.api_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("apiTimeoutSeconds must be greater than zero"));
        }

        if !self.job.is_configured() {
            return Err(anyhow::anyhow!(
                "job.image is not configured. Set it in the config file or via WORKER_IMAGE."
            ));
        }
        if self.job.command.is_empty() {
            return Err(anyhow::anyhow!("job.command must contain the worker entrypoint"));
        }
        if self.job.model_volume.claim_name.trim().is_empty() {
            return Err(anyhow::anyhow!("job.modelVolume.claimName must not be empty"));
        }
        if !self.job.model_volume.mount_path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "job.modelVolume.mountPath must be absolute, got '{}'",
                self.job.model_volume.mount_path
            ));
        }

        if self.restart.max_attempts == 0 {
            return Err(anyhow::anyhow!("restart.maxAttempts must be at least 1"));
        }

        if self.state.persist && self.state.config_map_name.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "state.configMapName is required when state.persist is enabled"
            ));
        }

        if self.leader_election.enabled
            && self.leader_election.renew_interval_seconds
                >= self.leader_election.lease_duration_seconds
        {
            return Err(anyhow::anyhow!(
                "leaderElection.renewIntervalSeconds must be shorter than leaseDurationSeconds"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        if !Path::new(config_path).exists() {
            return Err(anyhow::anyhow!("Config file not found: {config_path}"));
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: WatcherConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Apply per-deployment environment overrides on top of the file values
    pub fn apply_env_overrides(&mut self) -> Result<(), anyhow::Error> {
        if let Ok(namespace) = std::env::var("NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(name) = std::env::var("WATCHED_CONFIGMAP") {
            self.watched_config_map = name;
        }
        if let Ok(name) = std::env::var("DEPENDENT_DEPLOYMENT") {
            self.dependent_deployment = name;
        }
        if let Ok(image) = std::env::var("WORKER_IMAGE") {
            self.job.image = image;
        }
        if let Ok(interval) = std::env::var("POLL_INTERVAL_SECONDS") {
            self.poll_interval_seconds = interval.trim().parse().map_err(|e| {
                anyhow::anyhow!("POLL_INTERVAL_SECONDS must be a whole number of seconds: {e}")
            })?;
        }
        Ok(())
    }
}
