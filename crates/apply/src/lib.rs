//! kubeinit apply: create-or-update for any resource kind, plus create-only for
//! objects that are never modified in place.

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::core::DynamicObject;
use kubeinit_core::{ClusterClient, ClusterError, Document, ResourceDescriptor};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { resource_version: Option<String> },
    /// `summary` compares the desired document with what was live before the update.
    Updated { resource_version: Option<String>, summary: DiffSummary },
}

impl UpsertOutcome {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            UpsertOutcome::Created { resource_version } | UpsertOutcome::Updated { resource_version, .. } => {
                resource_version.as_deref()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("converting {target} to a document")]
    Convert { target: String, #[source] source: serde_json::Error },
    #[error("getting {target}")]
    Get { target: String, #[source] source: ClusterError },
    #[error("creating {target}")]
    Create { target: String, #[source] source: ClusterError },
    #[error("updating {target}")]
    Update { target: String, #[source] source: ClusterError },
}

impl UpsertError {
    pub fn phase(&self) -> &'static str {
        match self {
            UpsertError::Convert { .. } => "convert",
            UpsertError::Get { .. } => "get",
            UpsertError::Create { .. } => "create",
            UpsertError::Update { .. } => "update",
        }
    }

    pub fn cluster_error(&self) -> Option<&ClusterError> {
        match self {
            UpsertError::Convert { .. } => None,
            UpsertError::Get { source, .. }
            | UpsertError::Create { source, .. }
            | UpsertError::Update { source, .. } => Some(source),
        }
    }
}

/// Make the live object addressed by `target` match `desired`.
///
/// A missing object is created; an existing one is replaced with the desired
/// body, keeping the identity fields the server handed back on `get`. Exactly
/// one mutation happens per call and nothing is retried: a concurrent writer
/// shows up as `UpsertError::Update` wrapping `ClusterError::Conflict`.
pub async fn upsert<C, K>(client: &C, target: &ResourceDescriptor, desired: &K) -> Result<UpsertOutcome, UpsertError>
where
    C: ClusterClient + ?Sized,
    K: Document,
{
    let t0 = Instant::now();
    counter!("upsert_attempts", 1u64);
    let res = upsert_inner(client, target, desired).await;
    histogram!("upsert_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(UpsertOutcome::Created { .. }) => counter!("upsert_created", 1u64),
        Ok(UpsertOutcome::Updated { .. }) => counter!("upsert_updated", 1u64),
        Err(_) => counter!("upsert_err", 1u64),
    }
    res
}

async fn upsert_inner<C, K>(client: &C, target: &ResourceDescriptor, desired: &K) -> Result<UpsertOutcome, UpsertError>
where
    C: ClusterClient + ?Sized,
    K: Document,
{
    let doc = desired_document(target, desired)?;
    match client.get(target).await {
        Err(e) if e.is_not_found() => {
            debug!(target = %target, "not found; creating");
            let created = client
                .create(target, doc)
                .await
                .map_err(|source| UpsertError::Create { target: target.to_string(), source })?;
            info!(target = %target, rv = ?created.metadata.resource_version, "created");
            Ok(UpsertOutcome::Created { resource_version: created.metadata.resource_version })
        }
        Err(source) => Err(UpsertError::Get { target: target.to_string(), source }),
        Ok(live) => {
            let summary = diff_documents(&doc, &live)
                .map_err(|source| UpsertError::Convert { target: target.to_string(), source })?;
            let doc = carry_identity(doc, &live);
            let updated = client
                .update(target, doc)
                .await
                .map_err(|source| UpsertError::Update { target: target.to_string(), source })?;
            info!(
                target = %target,
                rv = ?updated.metadata.resource_version,
                adds = summary.adds, updates = summary.updates, removes = summary.removes,
                "updated"
            );
            Ok(UpsertOutcome::Updated { resource_version: updated.metadata.resource_version, summary })
        }
    }
}

/// Create `desired` without looking for an existing object first.
/// A name collision surfaces as `UpsertError::Create` wrapping `ClusterError::AlreadyExists`.
pub async fn create_only<C, K>(client: &C, target: &ResourceDescriptor, desired: &K) -> Result<DynamicObject, UpsertError>
where
    C: ClusterClient + ?Sized,
    K: Document,
{
    counter!("create_only_attempts", 1u64);
    let doc = desired_document(target, desired)?;
    match client.create(target, doc).await {
        Ok(obj) => {
            info!(target = %target, uid = ?obj.metadata.uid, "created");
            Ok(obj)
        }
        Err(source) => {
            counter!("create_only_err", 1u64);
            Err(UpsertError::Create { target: target.to_string(), source })
        }
    }
}

fn desired_document<K: Document>(target: &ResourceDescriptor, desired: &K) -> Result<DynamicObject, UpsertError> {
    let mut doc = desired
        .to_document()
        .map_err(|source| UpsertError::Convert { target: target.to_string(), source })?;
    ensure_metadata(&mut doc, target);
    Ok(doc)
}

fn ensure_metadata(doc: &mut DynamicObject, target: &ResourceDescriptor) {
    doc.metadata.name = Some(target.name().to_string());
    doc.metadata.namespace = Some(target.namespace().to_string());
}

/// Server-owned identity survives the body replacement; everything else comes from `doc`.
fn carry_identity(mut doc: DynamicObject, live: &DynamicObject) -> DynamicObject {
    doc.metadata.resource_version = live.metadata.resource_version.clone();
    doc.metadata.uid = live.metadata.uid.clone();
    doc.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
    doc
}

fn diff_documents(desired: &DynamicObject, live: &DynamicObject) -> Result<DiffSummary, serde_json::Error> {
    let desired = strip_noisy(serde_json::to_value(desired)?);
    let live = strip_noisy(serde_json::to_value(live)?);
    Ok(diff_summary(&desired, &live))
}

/// Drop server-populated fields so a document can be compared with what was sent.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, adds, ups, rems),
                        None => *adds += 1,
                    }
                }
                *rems += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (V::Array(aa), V::Array(bb)) => {
                *ups += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s.adds, &mut s.updates, &mut s.removes);
    s
}
