//! kubeinit core: resource addressing, the cluster client seam and its error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[cfg(feature = "test-util")]
pub mod memory;

/// Addresses one namespaced object of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    group: String,
    version: String,
    kind: String,
    plural: String,
    namespace: String,
    name: String,
}

impl ResourceDescriptor {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Descriptor for a statically typed kind, e.g. `ResourceDescriptor::of::<Deployment>("apps", "web")`.
    pub fn of<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self::new(
            K::group(&()),
            K::version(&()),
            K::kind(&()),
            K::plural(&()),
            namespace,
            name,
        )
    }

    pub fn group(&self) -> &str { &self.group }
    pub fn version(&self) -> &str { &self.version }
    pub fn kind(&self) -> &str { &self.kind }
    pub fn plural(&self) -> &str { &self.plural }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// kube-rs addressing for dynamic `Api` handles.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A typed object that can be turned into a kind-agnostic document and back.
///
/// Every k8s-openapi resource gets this through serde: the typed value is
/// serialized in full (apiVersion and kind included) and re-read as a
/// `DynamicObject`, so no field is dropped on the way.
pub trait Document: Sized {
    fn to_document(&self) -> Result<DynamicObject, serde_json::Error>;
    fn from_document(doc: &DynamicObject) -> Result<Self, serde_json::Error>;
}

impl<K> Document for K
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    fn to_document(&self) -> Result<DynamicObject, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::from_value(value)
    }

    fn from_document(doc: &DynamicObject) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(doc)?;
        serde_json::from_value(value)
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflicting update on {target}: {message}")]
    Conflict { target: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("api request failed")]
    Transport(#[source] kube::Error),
}

impl ClusterError {
    /// Classify a kube-rs error for the object `target`.
    pub fn from_kube(target: impl fmt::Display, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(target.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(target.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict {
                target: target.to_string(),
                message: ae.message,
            },
            other => ClusterError::Transport(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// The slice of the orchestration API the reconciler consumes.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, target: &ResourceDescriptor) -> Result<DynamicObject, ClusterError>;

    async fn create(
        &self,
        target: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn update(
        &self,
        target: &ResourceDescriptor,
        object: DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Jobs in `namespace` matching a `key=value[,key=value]` selector.
    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn descriptor_from_typed_kind() {
        let d = ResourceDescriptor::of::<Deployment>("apps", "web");
        assert_eq!(d.group(), "apps");
        assert_eq!(d.version(), "v1");
        assert_eq!(d.plural(), "deployments");
        assert_eq!(d.api_version(), "apps/v1");
        assert_eq!(d.to_string(), "Deployment apps/web");

        let s = ResourceDescriptor::of::<Service>("apps", "web-lb");
        assert_eq!(s.group(), "");
        assert_eq!(s.api_version(), "v1");
        assert_eq!(s.gvk_key(), "v1/Service");
        assert_eq!(s.api_resource().plural, "services");
    }

    #[test]
    fn document_conversion_keeps_every_field() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("settings".into());
        cm.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        cm.data = Some(BTreeMap::from([("LOG".to_string(), "debug".to_string())]));

        let doc = cm.to_document().unwrap();
        let types = doc.types.as_ref().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(doc.metadata.name.as_deref(), Some("settings"));
        assert_eq!(doc.data["data"]["LOG"], "debug");

        let back = ConfigMap::from_document(&doc).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn kube_errors_are_classified() {
        assert!(ClusterError::from_kube("Job ns/x", api_err(404, "NotFound")).is_not_found());
        assert!(matches!(
            ClusterError::from_kube("Job ns/x", api_err(409, "AlreadyExists")),
            ClusterError::AlreadyExists(t) if t == "Job ns/x"
        ));
        assert!(matches!(
            ClusterError::from_kube("Job ns/x", api_err(409, "Conflict")),
            ClusterError::Conflict { .. }
        ));
        assert!(matches!(
            ClusterError::from_kube("Job ns/x", api_err(403, "Forbidden")),
            ClusterError::Transport(_)
        ));
    }
}
