//! Regeneration Job resources.
//!
//! Builds the typed `batch/v1` Job that runs the rules generator once for a
//! given dataset. Nothing here talks to the API server.

use crate::config::JobTemplateConfig;
use crate::dataset::DatasetParams;
use crate::fingerprint::Fingerprint;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "ml-watcher";
pub const DATASET_LABEL: &str = "ml-watcher.5dlabs.com/dataset";
pub const FINGERPRINT_LABEL: &str = "ml-watcher.5dlabs.com/fingerprint";
pub const FINGERPRINT_ANNOTATION: &str = "ml-watcher.5dlabs.com/fingerprint";
pub const MODEL_PATH_ANNOTATION: &str = "ml-watcher.5dlabs.com/model-path";

const CONTAINER_NAME: &str = "rules-generator";
const MODEL_VOLUME_NAME: &str = "model-storage";
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Everything needed to submit one regeneration run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub namespace: String,
    pub fingerprint: Fingerprint,
    pub params: DatasetParams,
}

/// Label selector matching jobs created for `fingerprint`.
pub fn fingerprint_selector(fingerprint: &Fingerprint) -> String {
    format!(
        "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{FINGERPRINT_LABEL}={}",
        fingerprint.label_value()
    )
}

/// Worker arguments following the generator's command-line contract.
pub fn worker_args(params: &DatasetParams, model_path: &str) -> Vec<String> {
    let hp = &params.hyperparameters;
    let mut args = vec![
        params.dataset_url.clone(),
        "--output".to_string(),
        model_path.to_string(),
        "--min-support".to_string(),
        hp.min_support.to_string(),
        "--min-confidence".to_string(),
        hp.min_confidence.to_string(),
        "--min-lift".to_string(),
        hp.min_lift.to_string(),
    ];
    if let Some(max_len) = hp.max_len {
        args.push("--max-len".to_string());
        args.push(max_len.to_string());
    }
    args
}

/// Build the Job manifest for a regeneration run.
pub fn build_job(spec: &TaskSpec, template: &JobTemplateConfig) -> Job {
    let params = &spec.params;
    let model_path = template.model_path(&params.model_filename);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(DATASET_LABEL.to_string(), label_value(&params.dataset_name));
    labels.insert(
        FINGERPRINT_LABEL.to_string(),
        spec.fingerprint.label_value().to_string(),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        FINGERPRINT_ANNOTATION.to_string(),
        spec.fingerprint.to_string(),
    );
    annotations.insert(MODEL_PATH_ANNOTATION.to_string(), model_path.clone());

    let env = [
        ("DATASET_URL", params.dataset_url.clone()),
        ("DATASET_NAME", params.dataset_name.clone()),
        ("MODEL_PATH", model_path.clone()),
        ("MIN_SUPPORT", params.hyperparameters.min_support.to_string()),
        (
            "MIN_CONFIDENCE",
            params.hyperparameters.min_confidence.to_string(),
        ),
        ("MIN_LIFT", params.hyperparameters.min_lift.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    })
    .collect();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        image_pull_policy: template.image_pull_policy.clone(),
        command: Some(template.command.clone()),
        args: Some(worker_args(params, &model_path)),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: MODEL_VOLUME_NAME.to_string(),
            mount_path: template.model_volume.mount_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: template.service_account_name.clone(),
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: MODEL_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: template.model_volume.claim_name.clone(),
                read_only: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(template.backoff_limit),
            ttl_seconds_after_finished: Some(template.ttl_seconds_after_finished),
            active_deadline_seconds: template.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Coerce arbitrary text into a valid label value.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LENGTH)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
