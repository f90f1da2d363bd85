//! kubeinit ops: one reconciliation pass over the migration job and the
//! long-running workload.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kubeinit_core::ClusterClient;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub mod history;
pub mod migration;
pub mod workload;

pub use history::{completion_label_selector, latest_successful, MIGRATION_SELECTOR};
pub use migration::{assess, dispatch, dispatch_with, DispatchError, DispatchOutcome, FreshnessDecision, MigrationJobSpec};
pub use workload::{provision, ProvisionError, ProvisionReport, SecretMount, ServiceSpec, WorkloadSpec};

/// CPU/memory requests and limits for a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpu_request: "250m".into(),
            memory_request: "256Mi".into(),
            cpu_limit: "500m".into(),
            memory_limit: "512Mi".into(),
        }
    }
}

impl ResourceProfile {
    pub fn requirements(&self) -> ResourceRequirements {
        let pair = |cpu: &str, mem: &str| {
            BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(mem.to_string())),
            ])
        };
        ResourceRequirements {
            requests: Some(pair(&self.cpu_request, &self.memory_request)),
            limits: Some(pair(&self.cpu_limit, &self.memory_limit)),
            ..Default::default()
        }
    }
}

/// What one pass converges. Either half may be switched off.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub migration: Option<MigrationJobSpec>,
    pub workload: Option<WorkloadSpec>,
    /// Age after which the last successful migration is rerun.
    pub staleness: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { migration: None, workload: None, staleness: migration::DEFAULT_STALENESS }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub migration: Option<DispatchOutcome>,
    pub workload: Option<ProvisionReport>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Migration(#[from] DispatchError),
    #[error(transparent)]
    Workload(#[from] ProvisionError),
}

/// Run the migration policy, then converge the workload. The first error ends
/// the pass; whatever already converged stays as it is.
pub async fn reconcile_once<C>(client: &C, config: &ReconcileConfig, now: DateTime<Utc>) -> Result<PassReport, ReconcileError>
where
    C: ClusterClient + ?Sized,
{
    let mut report = PassReport::default();
    if let Some(spec) = &config.migration {
        report.migration = Some(dispatch_with(client, spec, now, config.staleness).await?);
    }
    if let Some(spec) = &config.workload {
        report.workload = Some(provision(client, spec).await?);
    }
    info!(
        migration = ?report.migration.as_ref().map(|m| m.decision),
        workload = report.workload.is_some(),
        "reconcile pass finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_renders_requests_and_limits() {
        let r = ResourceProfile::default().requirements();
        let req = r.requests.unwrap();
        let lim = r.limits.unwrap();
        assert_eq!(req["cpu"].0, "250m");
        assert_eq!(req["memory"].0, "256Mi");
        assert_eq!(lim["cpu"].0, "500m");
        assert_eq!(lim["memory"].0, "512Mi");
    }
}
