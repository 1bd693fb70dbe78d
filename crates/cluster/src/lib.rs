//! Skiff cluster gateway: the one component that talks to the live cluster.
//!
//! Everything is synchronous from the orchestrator's point of view: unary
//! calls, no streams, no internal retries. Transient cluster failures surface
//! as `GatewayError::Unavailable` for the caller's retry policy to handle.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_model::{Resource, ResourceId};
use thiserror::Error;
use tracing::{debug, warn};

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "skiff";

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The cluster API could not be reached. Retryable by the caller; never
    /// retried here.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    /// The target object (or its kind) does not exist. A no-op for delete,
    /// fatal for apply/describe/scale.
    #[error("{0} not found")]
    NotFound(String),
    #[error("cluster api: {0}")]
    Api(String),
}

fn map_kube_err(context: &str, e: kube::Error) -> GatewayError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound(context.to_string()),
        kube::Error::Api(ae) => GatewayError::Api(format!("{}: {}", context, ae)),
        other => GatewayError::Unavailable(format!("{}: {}", context, other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// One observed pod belonging to a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInstance {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub phase: InstancePhase,
    pub ready: bool,
}

impl PodInstance {
    /// Terminal "provisioned" check used by the steady-state poller: either
    /// the instance ran to completion, or it is running and ready.
    pub fn is_provisioned(&self) -> bool {
        matches!(self.phase, InstancePhase::Succeeded)
            || (matches!(self.phase, InstancePhase::Running) && self.ready)
    }
}

/// Result of applying a manifest set. `failed` carries the first resource
/// that could not be applied; everything in `applied` made it to the cluster
/// before that point.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<ResourceId>,
    pub failed: Option<(ResourceId, String)>,
}

impl ApplyReport {
    pub fn ok(&self) -> bool {
        self.failed.is_none()
    }
}

/// Narrow contract the orchestrator depends on. One implementation talks to a
/// real cluster; tests substitute an in-memory fake.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Server-side apply, one resource at a time, stopping at the first
    /// failure. Partial failure is reported, not rolled back.
    async fn apply(&self, resources: &[Resource]) -> Result<ApplyReport, GatewayError>;

    /// Best-effort human-readable status text for operator visibility.
    async fn describe(&self, id: &ResourceId) -> Result<String, GatewayError>;

    /// Live replica count of a workload.
    async fn replica_count(&self, id: &ResourceId) -> Result<i32, GatewayError>;

    async fn set_replica_count(&self, id: &ResourceId, replicas: i32) -> Result<(), GatewayError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInstance>, GatewayError>;

    /// Delete the given resources. Already-gone resources are skipped.
    async fn delete(&self, ids: &[ResourceId]) -> Result<(), GatewayError>;

    /// The cluster's own revision marker for a workload, when it has one.
    async fn latest_revision(&self, id: &ResourceId) -> Result<Option<String>, GatewayError>;
}

/// kube-rs implementation resolving kinds through API discovery and acting on
/// `DynamicObject`s, so CRD-backed workload kinds work the same as built-ins.
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect() -> Result<Self, GatewayError> {
        let client = Client::try_default()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("building client: {}", e)))?;
        Ok(Self::new(client))
    }

    /// Find the served API resource for a kind, optionally pinned to an
    /// apiVersion (known for parsed manifests, unknown for bare ids). When
    /// only the kind is known the first discovery match wins.
    async fn resolve(
        &self,
        kind: &str,
        api_version: Option<&str>,
    ) -> Result<(ApiResource, bool), GatewayError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| map_kube_err("discovery", e))?;
        let want = api_version.map(|av| match av.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), av.to_string()),
        });
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.kind != kind {
                    continue;
                }
                if let Some((g, v)) = &want {
                    if &ar.group != g || &ar.version != v {
                        continue;
                    }
                }
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
        Err(GatewayError::NotFound(format!("kind {}", kind)))
    }

    async fn dynamic_api(
        &self,
        id: &ResourceId,
        api_version: Option<&str>,
    ) -> Result<Api<DynamicObject>, GatewayError> {
        let (ar, namespaced) = self.resolve(&id.kind, api_version).await?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &id.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }

    async fn get_live(&self, id: &ResourceId) -> Result<Json, GatewayError> {
        let api = self.dynamic_api(id, None).await?;
        let obj = api
            .get_opt(&id.name)
            .await
            .map_err(|e| map_kube_err(&id.kind_name_ref(), e))?
            .ok_or_else(|| GatewayError::NotFound(id.kind_name_ref()))?;
        serde_json::to_value(&obj).map_err(|e| GatewayError::Api(e.to_string()))
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn apply(&self, resources: &[Resource]) -> Result<ApplyReport, GatewayError> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let mut report = ApplyReport::default();
        for resource in resources {
            let id = resource.id();
            let api = match self.dynamic_api(id, Some(resource.api_version())).await {
                Ok(api) => api,
                Err(e) => {
                    report.failed = Some((id.clone(), e.to_string()));
                    break;
                }
            };
            let pp = PatchParams::apply(FIELD_MANAGER);
            match api.patch(&id.name, &pp, &Patch::Apply(resource.doc())).await {
                Ok(_) => {
                    debug!(resource = %id, "applied");
                    report.applied.push(id.clone());
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    report.failed = Some((id.clone(), map_kube_err(&id.kind_name_ref(), e).to_string()));
                    break;
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if report.ok() {
            counter!("apply_ok", 1u64);
        }
        Ok(report)
    }

    async fn describe(&self, id: &ResourceId) -> Result<String, GatewayError> {
        let live = self.get_live(id).await?;
        Ok(render_describe(id, &live))
    }

    async fn replica_count(&self, id: &ResourceId) -> Result<i32, GatewayError> {
        let live = self.get_live(id).await?;
        Ok(read_replicas(&live))
    }

    async fn set_replica_count(&self, id: &ResourceId, replicas: i32) -> Result<(), GatewayError> {
        let api = self.dynamic_api(id, None).await?;
        let payload = serde_json::json!({"spec": {"replicas": replicas}});
        // Scale subresource first; some kinds only allow patching spec.replicas.
        let pp = PatchParams::default();
        match api.patch_scale(&id.name, &pp, &Patch::Merge(&payload)).await {
            Ok(_) => return Ok(()),
            Err(e) => warn!(resource = %id, error = %e, "patch_scale failed; falling back to spec.replicas"),
        }
        api.patch(&id.name, &pp, &Patch::Merge(&payload))
            .await
            .map_err(|e| map_kube_err(&id.kind_name_ref(), e))?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInstance>, GatewayError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        let pods = api.list(&lp).await.map_err(|e| map_kube_err("listing pods", e))?;
        Ok(pods.items.iter().map(instance_from_pod).collect())
    }

    async fn delete(&self, ids: &[ResourceId]) -> Result<(), GatewayError> {
        for id in ids {
            let api = match self.dynamic_api(id, None).await {
                Ok(api) => api,
                Err(GatewayError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match api.delete(&id.name, &DeleteParams::default()).await {
                Ok(_) => debug!(resource = %id, "deleted"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(resource = %id, "already gone")
                }
                Err(e) => return Err(map_kube_err(&id.kind_name_ref(), e)),
            }
        }
        Ok(())
    }

    async fn latest_revision(&self, id: &ResourceId) -> Result<Option<String>, GatewayError> {
        let live = self.get_live(id).await?;
        Ok(read_revision(&live))
    }
}

fn parse_phase(phase: &str) -> InstancePhase {
    match phase {
        "Pending" => InstancePhase::Pending,
        "Running" => InstancePhase::Running,
        "Succeeded" => InstancePhase::Succeeded,
        "Failed" => InstancePhase::Failed,
        _ => InstancePhase::Unknown,
    }
}

fn instance_from_pod(pod: &Pod) -> PodInstance {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .map(parse_phase)
        .unwrap_or(InstancePhase::Unknown);
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    PodInstance {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone(),
        phase,
        ready,
    }
}

fn read_replicas(live: &Json) -> i32 {
    live.get("spec")
        .and_then(|s| s.get("replicas"))
        .or_else(|| live.get("status").and_then(|s| s.get("replicas")))
        .and_then(Json::as_i64)
        .unwrap_or(0) as i32
}

fn read_revision(live: &Json) -> Option<String> {
    let annotated = live
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .and_then(Json::as_str)
        .map(|s| s.to_string());
    annotated.or_else(|| {
        live.get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Json::as_i64)
            .map(|g| g.to_string())
    })
}

fn render_describe(id: &ResourceId, live: &Json) -> String {
    let mut out = format!("{} (namespace {})\n", id.kind_name_ref(), id.namespace);
    let spec_replicas = live.get("spec").and_then(|s| s.get("replicas")).and_then(Json::as_i64);
    let ready = live.get("status").and_then(|s| s.get("readyReplicas")).and_then(Json::as_i64);
    if let Some(n) = spec_replicas {
        out.push_str(&format!("  replicas: {} desired, {} ready\n", n, ready.unwrap_or(0)));
    }
    if let Some(conditions) = live
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Json::as_array)
    {
        for c in conditions {
            let ctype = c.get("type").and_then(Json::as_str).unwrap_or("?");
            let cstatus = c.get("status").and_then(Json::as_str).unwrap_or("?");
            out.push_str(&format!("  condition {}: {}\n", ctype, cstatus));
        }
    }
    out
}
