//! Freshness-gated dispatch of the database migration job.
//!
//! Each pass lists the migration jobs, finds the last successful completion and
//! launches a new job only when there is none or it is older than the staleness
//! threshold. Nothing is remembered between passes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kubeinit_apply::{create_only, UpsertError};
use kubeinit_core::{ClusterClient, ClusterError, ResourceDescriptor};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::history::{completion_label_selector, latest_successful};
use crate::ResourceProfile;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(120);
pub const DEFAULT_TTL_SECONDS: i32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessDecision {
    NoPriorSuccess,
    StaleCompletion,
    FreshCompletion,
    /// Job reports success but carries no completion time.
    AmbiguousCompletion,
}

impl FreshnessDecision {
    pub fn requires_dispatch(self) -> bool { !matches!(self, FreshnessDecision::FreshCompletion) }

    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessDecision::NoPriorSuccess => "no_prior_success",
            FreshnessDecision::StaleCompletion => "stale_completion",
            FreshnessDecision::FreshCompletion => "fresh_completion",
            FreshnessDecision::AmbiguousCompletion => "ambiguous_completion",
        }
    }
}

impl fmt::Display for FreshnessDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Classify the latest successful job against `now`.
/// A completion exactly `threshold` old is still fresh.
pub fn assess(latest: Option<&Job>, now: DateTime<Utc>, threshold: Duration) -> FreshnessDecision {
    let Some(job) = latest else { return FreshnessDecision::NoPriorSuccess };
    let Some(done) = job.status.as_ref().and_then(|s| s.completion_time.as_ref()) else {
        return FreshnessDecision::AmbiguousCompletion;
    };
    match (now - done.0).to_std() {
        Ok(age) if age > threshold => FreshnessDecision::StaleCompletion,
        // negative age (clock skew) counts as fresh
        _ => FreshnessDecision::FreshCompletion,
    }
}

/// Everything needed to render the migration Job.
#[derive(Debug, Clone)]
pub struct MigrationJobSpec {
    /// Reused on every dispatch; the TTL removes the previous job.
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub volume_name: String,
    pub secret_name: String,
    pub mount_path: String,
    pub sub_path: Option<String>,
    /// Applied to the job and its pods; must satisfy `selector`.
    pub labels: BTreeMap<String, String>,
    pub selector: String,
    pub ttl_seconds_after_finished: i32,
    pub image_pull_secret: Option<String>,
    pub resources: ResourceProfile,
}

impl MigrationJobSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        let labels = BTreeMap::from([
            ("workload".to_string(), "job".to_string()),
            ("app".to_string(), "go-infra".to_string()),
            ("workload-type".to_string(), "db-migration".to_string()),
        ]);
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            command: vec!["/app/migrate".to_string()],
            volume_name: "k3s-env".to_string(),
            secret_name: "k3s-env".to_string(),
            mount_path: "/app/.env".to_string(),
            sub_path: Some(".env".to_string()),
            labels,
            selector: completion_label_selector().to_string(),
            ttl_seconds_after_finished: DEFAULT_TTL_SECONDS,
            image_pull_secret: Some("ghcr".to_string()),
            resources: ResourceProfile::default(),
        }
    }
}

/// The Job object for `spec`: one container, the env secret mounted as a file,
/// restarted on failure and garbage-collected `ttl_seconds_after_finished` after it ends.
pub fn job(spec: &MigrationJobSpec) -> Job {
    let container = Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".into()),
        command: Some(spec.command.clone()),
        volume_mounts: Some(vec![VolumeMount {
            name: spec.volume_name.clone(),
            mount_path: spec.mount_path.clone(),
            sub_path: spec.sub_path.clone(),
            ..Default::default()
        }]),
        resources: Some(spec.resources.requirements()),
        ..Default::default()
    };
    let volume = Volume {
        name: spec.volume_name.clone(),
        secret: Some(SecretVolumeSource { secret_name: Some(spec.secret_name.clone()), ..Default::default() }),
        ..Default::default()
    };
    Job {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(spec.ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(spec.labels.clone()), ..Default::default() }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".into()),
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    image_pull_secrets: spec
                        .image_pull_secret
                        .as_ref()
                        .map(|s| vec![LocalObjectReference { name: Some(s.clone()) }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub decision: FreshnessDecision,
    /// Name of the job whose completion was judged, if any.
    pub latest: Option<String>,
    /// Set when this pass created a job.
    pub created: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("error retrieving batch jobs in namespace {namespace}")]
    ListJobs { namespace: String, #[source] source: ClusterError },
    #[error("error creating migration job {name}")]
    CreateJob { name: String, #[source] source: UpsertError },
}

/// One pass of the migration policy at time `now` with the default staleness.
pub async fn dispatch<C>(client: &C, spec: &MigrationJobSpec, now: DateTime<Utc>) -> Result<DispatchOutcome, DispatchError>
where
    C: ClusterClient + ?Sized,
{
    dispatch_with(client, spec, now, DEFAULT_STALENESS).await
}

/// Like [`dispatch`], rerunning completions older than `staleness`.
pub async fn dispatch_with<C>(
    client: &C,
    spec: &MigrationJobSpec,
    now: DateTime<Utc>,
    staleness: Duration,
) -> Result<DispatchOutcome, DispatchError>
where
    C: ClusterClient + ?Sized,
{
    let jobs = client
        .list_jobs(&spec.namespace, &spec.selector)
        .await
        .map_err(|source| DispatchError::ListJobs { namespace: spec.namespace.clone(), source })?;
    debug!(ns = %spec.namespace, selector = %spec.selector, count = jobs.len(), "migration jobs observed");

    let latest = latest_successful(&jobs);
    let decision = assess(latest, now, staleness);
    let latest_name = latest.and_then(|j| j.metadata.name.clone());
    counter!("migration_decisions", 1u64, "decision" => decision.as_str());

    match decision {
        FreshnessDecision::FreshCompletion => {
            info!(job = ?latest_name, "last migration is fresh; nothing to do");
            return Ok(DispatchOutcome { decision, latest: latest_name, created: None });
        }
        FreshnessDecision::AmbiguousCompletion => {
            warn!(job = ?latest_name, "job reports completion without completionTime; treating as stale");
        }
        FreshnessDecision::NoPriorSuccess => info!("no successful migration found; dispatching"),
        FreshnessDecision::StaleCompletion => info!(job = ?latest_name, "last migration is stale; dispatching"),
    }

    let target = ResourceDescriptor::of::<Job>(&spec.namespace, &spec.name);
    create_only(client, &target, &job(spec))
        .await
        .map_err(|source| DispatchError::CreateJob { name: spec.name.clone(), source })?;
    counter!("migration_dispatched", 1u64);
    Ok(DispatchOutcome { decision, latest: latest_name, created: Some(spec.name.clone()) })
}
