//! In-memory `ClusterClient` for tests: stores documents by descriptor and
//! counts calls, with the same NotFound/AlreadyExists/Conflict answers an API
//! server gives.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::core::DynamicObject;

use crate::{ClusterClient, ClusterError, Document, ResourceDescriptor};

type Key = (String, String, String, String);

fn key(target: &ResourceDescriptor) -> Key {
    (
        target.group().to_string(),
        target.plural().to_string(),
        target.namespace().to_string(),
        target.name().to_string(),
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub create: usize,
    pub update: usize,
    pub list: usize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    /// Jobs visible to `list_jobs`, in insertion order.
    jobs: Vec<Job>,
    calls: CallCounts,
    next_rv: u64,
    fail_list: bool,
    fail_create: bool,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Seed job history as if observed from the cluster.
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        let me = Self::default();
        me.lock().jobs = jobs;
        me
    }

    pub fn fail_list_jobs(&self) { self.lock().fail_list = true; }
    pub fn fail_create(&self) { self.lock().fail_create = true; }

    pub fn calls(&self) -> CallCounts { self.lock().calls }

    pub fn object(&self, target: &ResourceDescriptor) -> Option<DynamicObject> {
        self.lock().objects.get(&key(target)).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> { self.lock().jobs.clone() }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn matches_selector(job: &Job, selector: &str) -> bool {
    let labels = job.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(|have| have == v.trim()).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, target: &ResourceDescriptor) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        st.calls.get += 1;
        st.objects
            .get(&key(target))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(target.to_string()))
    }

    async fn create(&self, target: &ResourceDescriptor, mut object: DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        st.calls.create += 1;
        if st.fail_create {
            return Err(ClusterError::Timeout(Duration::from_secs(10)));
        }
        let k = key(target);
        if st.objects.contains_key(&k) {
            return Err(ClusterError::AlreadyExists(target.to_string()));
        }
        st.next_rv += 1;
        object.metadata.resource_version = Some(st.next_rv.to_string());
        object.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", st.next_rv));
        if target.kind() == "Job" {
            if let Ok(job) = Job::from_document(&object) {
                st.jobs.push(job);
            }
        }
        st.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn update(&self, target: &ResourceDescriptor, mut object: DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        st.calls.update += 1;
        let k = key(target);
        let live_rv = match st.objects.get(&k) {
            Some(live) => live.metadata.resource_version.clone(),
            None => return Err(ClusterError::NotFound(target.to_string())),
        };
        if let Some(rv) = object.metadata.resource_version.as_deref() {
            if Some(rv) != live_rv.as_deref() {
                return Err(ClusterError::Conflict {
                    target: target.to_string(),
                    message: "the object has been modified".into(),
                });
            }
        }
        st.next_rv += 1;
        object.metadata.resource_version = Some(st.next_rv.to_string());
        st.objects.insert(k, object.clone());
        Ok(object)
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, ClusterError> {
        let mut st = self.lock();
        st.calls.list += 1;
        if st.fail_list {
            return Err(ClusterError::Timeout(Duration::from_secs(10)));
        }
        Ok(st
            .jobs
            .iter()
            .filter(|j| j.metadata.namespace.as_deref().map(|ns| ns == namespace).unwrap_or(true))
            .filter(|j| matches_selector(j, label_selector))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    fn labelled_job(name: &str, labels: &[(&str, &str)]) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(name.into());
        job.metadata.namespace = Some("ns".into());
        job.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
        job
    }

    #[tokio::test]
    async fn create_then_update_bumps_resource_version() {
        let cluster = MemoryCluster::new();
        let target = ResourceDescriptor::of::<ConfigMap>("ns", "cm");
        let doc = ConfigMap::default().to_document().unwrap();

        assert!(cluster.get(&target).await.unwrap_err().is_not_found());
        let created = cluster.create(&target, doc.clone()).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(matches!(cluster.create(&target, doc.clone()).await, Err(ClusterError::AlreadyExists(_))));

        let updated = cluster.update(&target, created).await.unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));

        let mut stale = updated.clone();
        stale.metadata.resource_version = Some("1".into());
        assert!(matches!(cluster.update(&target, stale).await, Err(ClusterError::Conflict { .. })));
        assert_eq!(cluster.calls(), CallCounts { get: 1, create: 2, update: 2, list: 0 });
    }

    #[tokio::test]
    async fn list_jobs_filters_by_selector() {
        let cluster = MemoryCluster::with_jobs(vec![
            labelled_job("a", &[("workload-type", "db-migration")]),
            labelled_job("b", &[("workload-type", "batch")]),
            labelled_job("c", &[("workload-type", "db-migration"), ("app", "go-infra")]),
        ]);
        let names = |jobs: Vec<Job>| jobs.into_iter().filter_map(|j| j.metadata.name).collect::<Vec<_>>();
        assert_eq!(names(cluster.list_jobs("ns", "workload-type=db-migration").await.unwrap()), vec!["a", "c"]);
        assert_eq!(names(cluster.list_jobs("ns", "workload-type=db-migration,app=go-infra").await.unwrap()), vec!["c"]);
        assert!(cluster.list_jobs("other", "").await.unwrap().is_empty());
    }
}
