#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kubeinit_apply::{strip_noisy, upsert, UpsertOutcome};
use kubeinit_core::memory::{CallCounts, MemoryCluster};
use kubeinit_core::ResourceDescriptor;

fn web(image: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
    Deployment {
        metadata: ObjectMeta { name: Some("web".into()), ..Default::default() },
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container { name: "web".into(), image: Some(image.into()), ..Default::default() }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stripped(cluster: &MemoryCluster, target: &ResourceDescriptor) -> serde_json::Value {
    let obj = cluster.object(target).expect("object stored");
    strip_noisy(serde_json::to_value(obj).unwrap())
}

#[tokio::test]
async fn second_identical_upsert_changes_nothing_observable() {
    let cluster = MemoryCluster::new();
    let target = ResourceDescriptor::of::<Deployment>("apps", "web");

    let first = upsert(&cluster, &target, &web("ghcr.io/acme/web:v1.0.0")).await.unwrap();
    assert!(matches!(first, UpsertOutcome::Created { .. }));
    let after_first = stripped(&cluster, &target);

    let second = upsert(&cluster, &target, &web("ghcr.io/acme/web:v1.0.0")).await.unwrap();
    match second {
        UpsertOutcome::Updated { summary, .. } => assert!(summary.is_empty(), "summary={:?}", summary),
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(stripped(&cluster, &target), after_first);
    assert_eq!(cluster.calls(), CallCounts { get: 2, create: 1, update: 1, list: 0 });
}

#[tokio::test]
async fn changed_desired_state_replaces_the_body() {
    let cluster = MemoryCluster::new();
    let target = ResourceDescriptor::of::<Deployment>("apps", "web");

    upsert(&cluster, &target, &web("ghcr.io/acme/web:v1.0.0")).await.unwrap();
    let out = upsert(&cluster, &target, &web("ghcr.io/acme/web:v1.0.1")).await.unwrap();
    match out {
        UpsertOutcome::Updated { summary, resource_version } => {
            assert_eq!(summary.updates, 1);
            assert_eq!(resource_version.as_deref(), Some("2"));
        }
        other => panic!("expected update, got {:?}", other),
    }
    let live = stripped(&cluster, &target);
    assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "ghcr.io/acme/web:v1.0.1");
    assert_eq!(live["metadata"]["namespace"], "apps");
}
