//! Long-running workload: a Deployment and the LoadBalancer Service in front of it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, LocalObjectReference, PodSpec, PodTemplateSpec, SecretVolumeSource, Service,
    ServicePort, ServiceSpec as CoreServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kubeinit_apply::{upsert, UpsertError, UpsertOutcome};
use kubeinit_core::{ClusterClient, ResourceDescriptor};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::ResourceProfile;

/// A secret exposed to the container as a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    /// Volume name; also the secret name unless `secret` differs.
    pub volume: String,
    pub secret: String,
    pub mount_path: String,
    pub sub_path: Option<String>,
}

impl SecretMount {
    pub fn file(secret: &str, mount_path: &str, key: &str) -> Self {
        Self {
            volume: secret.to_string(),
            secret: secret.to_string(),
            mount_path: mount_path.to_string(),
            sub_path: Some(key.to_string()),
        }
    }
}

pub fn default_secret_mounts() -> Vec<SecretMount> {
    vec![
        SecretMount::file("cf-token-ini", "/run/secrets/cf_token.ini", "cf_token.ini"),
        SecretMount::file("k3s-env", "/app/.env", "k3s.env"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    /// Port exposed by the load balancer; forwarded to the container port.
    pub port: i32,
    pub allocate_node_ports: bool,
}

#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    pub image: String,
    pub container_port: i32,
    pub command: Vec<String>,
    pub secret_mounts: Vec<SecretMount>,
    pub resources: ResourceProfile,
    pub image_pull_secret: Option<String>,
    /// `None` skips the Service.
    pub service: Option<ServiceSpec>,
}

impl WorkloadSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            replicas: 1,
            image: image.into(),
            container_port: 8993,
            command: vec!["/app/server".to_string()],
            secret_mounts: default_secret_mounts(),
            resources: ResourceProfile::default(),
            image_pull_secret: Some("ghcr".to_string()),
            service: None,
        }
    }
}

/// Label tying the Deployment's pods to its selector and to the Service.
pub fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

pub fn deployment(spec: &WorkloadSpec) -> Deployment {
    let labels = app_labels(&spec.name);
    let mounts = spec
        .secret_mounts
        .iter()
        .map(|m| VolumeMount {
            name: m.volume.clone(),
            mount_path: m.mount_path.clone(),
            sub_path: m.sub_path.clone(),
            ..Default::default()
        })
        .collect::<Vec<_>>();
    let volumes = spec
        .secret_mounts
        .iter()
        .map(|m| Volume {
            name: m.volume.clone(),
            secret: Some(SecretVolumeSource { secret_name: Some(m.secret.clone()), ..Default::default() }),
            ..Default::default()
        })
        .collect::<Vec<_>>();
    let container = Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".into()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        ports: Some(vec![ContainerPort { container_port: spec.container_port, ..Default::default() }]),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        resources: Some(spec.resources.requirements()),
        ..Default::default()
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
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

pub fn load_balancer(spec: &WorkloadSpec, svc: &ServiceSpec) -> Service {
    let labels = app_labels(&spec.name);
    Service {
        metadata: ObjectMeta {
            name: Some(svc.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(CoreServiceSpec {
            type_: Some("LoadBalancer".into()),
            allocate_load_balancer_node_ports: Some(svc.allocate_node_ports),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: svc.port,
                target_port: Some(IntOrString::Int(spec.container_port)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub deployment: UpsertOutcome,
    pub service: Option<UpsertOutcome>,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("error provisioning deployment {name}")]
    Deployment { name: String, #[source] source: UpsertError },
    #[error("error provisioning service {name}")]
    Service { name: String, #[source] source: UpsertError },
}

/// Converge the Deployment, then the Service if one is requested.
///
/// The Service selects pods by label only, so it may briefly select nothing
/// while the Deployment rolls out. The first failure stops the pass.
pub async fn provision<C>(client: &C, spec: &WorkloadSpec) -> Result<ProvisionReport, ProvisionError>
where
    C: ClusterClient + ?Sized,
{
    let target = ResourceDescriptor::of::<Deployment>(&spec.namespace, &spec.name);
    let deployed = upsert(client, &target, &deployment(spec))
        .await
        .map_err(|source| ProvisionError::Deployment { name: spec.name.clone(), source })?;
    info!(deployment = %spec.name, replicas = spec.replicas, image = %spec.image, "deployment converged");

    let service = match &spec.service {
        Some(svc) => {
            let target = ResourceDescriptor::of::<Service>(&spec.namespace, &svc.name);
            let out = upsert(client, &target, &load_balancer(spec, svc))
                .await
                .map_err(|source| ProvisionError::Service { name: svc.name.clone(), source })?;
            info!(service = %svc.name, port = svc.port, target_port = spec.container_port, "service converged");
            Some(out)
        }
        None => None,
    };
    Ok(ProvisionReport { deployment: deployed, service })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkloadSpec {
        let mut s = WorkloadSpec::new("infra", "go-infra", "ghcr.io/acme/go-infra:v1.0.13");
        s.replicas = 3;
        s.container_port = 8993;
        s.service = Some(ServiceSpec { name: "go-infra-service".into(), port: 443, allocate_node_ports: false });
        s
    }

    #[test]
    fn deployment_selector_matches_template_labels() {
        let d = deployment(&spec());
        let ds = d.spec.as_ref().unwrap();
        assert_eq!(ds.replicas, Some(3));
        let tmpl_labels = ds.template.metadata.as_ref().unwrap().labels.clone().unwrap();
        assert_eq!(ds.selector.match_labels.clone().unwrap(), tmpl_labels);
        assert_eq!(tmpl_labels["app"], "go-infra");

        let pod = ds.template.spec.as_ref().unwrap();
        let c = &pod.containers[0];
        assert_eq!(c.ports.as_ref().unwrap()[0].container_port, 8993);
        assert_eq!(c.volume_mounts.as_ref().unwrap().len(), 2);
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 2);
        let limits = c.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"].0, "512Mi");
    }

    #[test]
    fn service_forwards_exposed_port_to_container() {
        let s = spec();
        let svc = load_balancer(&s, s.service.as_ref().unwrap());
        let ss = svc.spec.as_ref().unwrap();
        assert_eq!(ss.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(ss.allocate_load_balancer_node_ports, Some(false));
        assert_eq!(ss.selector.clone().unwrap(), app_labels("go-infra"));
        let port = &ss.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(8993)));
    }

    #[test]
    fn empty_mounts_leave_volumes_unset() {
        let mut s = spec();
        s.secret_mounts.clear();
        let d = deployment(&s);
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert!(pod.volumes.is_none());
        assert!(pod.containers[0].volume_mounts.is_none());
    }
}
