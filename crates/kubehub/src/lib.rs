//! kubeinit kubehub: client bootstrap and the kube-rs backed `ClusterClient`.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{Api, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
    Client, Config,
};
use kubeinit_core::{ClusterClient, ClusterError, ResourceDescriptor};
use metrics::counter;
use tracing::{debug, info};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where cluster credentials come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClientSource {
    /// kube-rs resolution: `$KUBECONFIG`, `~/.kube/config`, then in-cluster.
    #[default]
    Infer,
    Kubeconfig(PathBuf),
    /// Service account token mounted into the pod.
    InCluster,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub source: ClientSource,
    /// Kubeconfig context; ignored for in-cluster.
    pub context: Option<String>,
    /// Deadline applied to every API request.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { source: ClientSource::default(), context: None, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

async fn load_config(opts: &ClientOptions) -> Result<Config> {
    let kco = KubeConfigOptions { context: opts.context.clone(), ..Default::default() };
    let config = match &opts.source {
        ClientSource::Infer if opts.context.is_some() => {
            Config::from_kubeconfig(&kco).await.context("loading kubeconfig context")?
        }
        ClientSource::Infer => Config::infer().await.context("inferring kube config")?,
        ClientSource::Kubeconfig(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &kco)
                .await
                .with_context(|| format!("loading kubeconfig at {}", path.display()))?
        }
        ClientSource::InCluster => Config::incluster().context("loading in-cluster config")?,
    };
    Ok(config)
}

/// Build an authenticated client according to `opts`.
pub async fn connect(opts: &ClientOptions) -> Result<Client> {
    let mut config = load_config(opts).await?;
    config.connect_timeout = Some(opts.request_timeout);
    config.read_timeout = Some(opts.request_timeout);
    info!(source = ?opts.source, cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

/// Ask the API server for its version; cheap connectivity check.
pub async fn server_version(client: &Client) -> Result<String> {
    let info = client.apiserver_version().await.context("querying api server version")?;
    Ok(info.git_version)
}

/// `ClusterClient` over a live API server. Every request is bounded by `timeout`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self { Self { client, timeout } }

    fn dynamic(&self, target: &ResourceDescriptor) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), target.namespace(), &target.api_resource())
    }

    async fn bounded<T, F>(&self, what: impl Display + Send, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                let err = ClusterError::from_kube(&what, e);
                if !err.is_not_found() {
                    counter!("kube_request_err", 1u64);
                }
                Err(err)
            }
            Err(_) => {
                counter!("kube_request_timeout", 1u64);
                Err(ClusterError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, target: &ResourceDescriptor) -> Result<DynamicObject, ClusterError> {
        debug!(target = %target, "get");
        let api = self.dynamic(target);
        self.bounded(target, api.get(target.name())).await
    }

    async fn create(&self, target: &ResourceDescriptor, object: DynamicObject) -> Result<DynamicObject, ClusterError> {
        debug!(target = %target, "create");
        let api = self.dynamic(target);
        let pp = PostParams::default();
        self.bounded(target, api.create(&pp, &object)).await
    }

    async fn update(&self, target: &ResourceDescriptor, object: DynamicObject) -> Result<DynamicObject, ClusterError> {
        debug!(target = %target, rv = ?object.metadata.resource_version, "update");
        let api = self.dynamic(target);
        let pp = PostParams::default();
        self.bounded(target, api.replace(target.name(), &pp, &object)).await
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, ClusterError> {
        debug!(ns = %namespace, selector = %label_selector, "list jobs");
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = self.bounded(format!("jobs in {}", namespace), api.list(&lp)).await?;
        Ok(list.items)
    }
}
