#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kubeinit_apply::UpsertOutcome;
use kubeinit_core::memory::MemoryCluster;
use kubeinit_core::{ClusterError, MockClusterClient, ResourceDescriptor};
use kubeinit_ops::{
    provision, reconcile_once, FreshnessDecision, MigrationJobSpec, ProvisionError, ReconcileConfig, ServiceSpec,
    WorkloadSpec,
};

fn workload(with_service: bool) -> WorkloadSpec {
    let mut w = WorkloadSpec::new("infra", "go-infra", "ghcr.io/acme/go-infra:v1.0.13");
    w.replicas = 2;
    if with_service {
        w.service = Some(ServiceSpec { name: "go-infra-service".into(), port: 443, allocate_node_ports: false });
    }
    w
}

#[tokio::test]
async fn full_pass_creates_then_converges() {
    let cluster = MemoryCluster::new();
    let config = ReconcileConfig {
        migration: Some(MigrationJobSpec::new("infra", "go-infra-migration", "ghcr.io/acme/go-infra:v1.0.13")),
        workload: Some(workload(true)),
        ..Default::default()
    };

    let first = reconcile_once(&cluster, &config, Utc::now()).await.unwrap();
    assert_eq!(first.migration.as_ref().unwrap().decision, FreshnessDecision::NoPriorSuccess);
    let wl = first.workload.as_ref().unwrap();
    assert!(matches!(wl.deployment, UpsertOutcome::Created { .. }));
    assert!(matches!(wl.service, Some(UpsertOutcome::Created { .. })));

    let svc = cluster.object(&ResourceDescriptor::of::<Service>("infra", "go-infra-service")).unwrap();
    assert_eq!(svc.data["spec"]["selector"]["app"], "go-infra");
    assert_eq!(svc.data["spec"]["ports"][0]["targetPort"], 8993);

    // Workload only: the migration job from the first pass is still running.
    let config = ReconcileConfig { migration: None, workload: Some(workload(true)), ..Default::default() };
    let second = reconcile_once(&cluster, &config, Utc::now()).await.unwrap();
    let wl = second.workload.unwrap();
    match wl.deployment {
        UpsertOutcome::Updated { summary, .. } => assert!(summary.is_empty()),
        other => panic!("expected update, got {:?}", other),
    }
    assert!(matches!(wl.service, Some(UpsertOutcome::Updated { .. })));
}

#[tokio::test]
async fn service_is_skipped_when_not_requested() {
    let cluster = MemoryCluster::new();
    let report = provision(&cluster, &workload(false)).await.unwrap();
    assert!(report.service.is_none());
    assert!(cluster.object(&ResourceDescriptor::of::<Deployment>("infra", "go-infra")).is_some());
    assert!(cluster.object(&ResourceDescriptor::of::<Service>("infra", "go-infra-service")).is_none());
}

#[tokio::test]
async fn deployment_failure_halts_before_the_service() {
    let mut client = MockClusterClient::new();
    client
        .expect_get()
        .times(1)
        .withf(|t| t.kind() == "Deployment")
        .returning(|_| Err(ClusterError::Timeout(Duration::from_secs(10))));
    client.expect_create().never();
    client.expect_update().never();

    let err = provision(&client, &workload(true)).await.unwrap_err();
    assert_eq!(err.to_string(), "error provisioning deployment go-infra");
    assert!(matches!(err, ProvisionError::Deployment { .. }));
}
