//! Shared rollout state machine: Init → Prepare → Apply → WaitSteady →
//! WrapUp → terminal. All state lives in an explicit `RolloutContext` value
//! threaded through the steps; every path that allocated a release records
//! the outcome in the ledger before returning.

use std::collections::HashSet;

use metrics::counter;
use skiff_cluster::{ClusterGateway, GatewayError, PodInstance};
use skiff_ledger::{HistoryStore, Release, ReleaseHistory, ReleaseStatus};
use skiff_model::{parse_manifests, Resource, ResourceId};
use skiff_wait::{wait_for_steady_state, SteadyState, WaitTarget};
use tracing::{debug, error, info, warn};

use crate::versioner::{self, VersionMode};
use crate::{
    release_selector, revision_selector, RolloutError, RolloutOutcome, RolloutRequest, ScaleTarget,
    Strategy,
};

/// Everything one invocation carries between steps. No hidden handler state.
struct RolloutContext {
    release: Release,
    resources: Vec<Resource>,
    managed_workload: Option<ResourceId>,
    desired_replicas: i32,
    pods: Option<Vec<PodInstance>>,
}

/// Run one rollout invocation to its terminal outcome.
///
/// Configuration errors (malformed manifests, ambiguous managed workload,
/// bad scale reference) return `Err` before the ledger is touched. Cluster
/// failures and steady-state timeouts come back as a `Failed` outcome whose
/// ledger entry was persisted first.
pub async fn run_rollout(
    gateway: &dyn ClusterGateway,
    store: &dyn HistoryStore,
    request: &RolloutRequest,
) -> Result<RolloutOutcome, RolloutError> {
    counter!("rollout_attempts", 1u64);
    let outcome = match &request.strategy {
        Strategy::Rolling => run_release(gateway, store, request, VersionMode::Rolling).await?,
        Strategy::Canary { instances } => {
            run_release(gateway, store, request, VersionMode::Canary { instances: *instances })
                .await?
        }
        Strategy::Scale { workload, target, skip_steady_check } => {
            run_scale(gateway, store, request, workload, *target, *skip_steady_check).await?
        }
    };
    match outcome.status {
        ReleaseStatus::Succeeded => counter!("rollout_succeeded", 1u64),
        _ => counter!("rollout_failed", 1u64),
    }
    Ok(outcome)
}

async fn run_release(
    gateway: &dyn ClusterGateway,
    store: &dyn HistoryStore,
    request: &RolloutRequest,
    mode: VersionMode,
) -> Result<RolloutOutcome, RolloutError> {
    // Init: load the persisted history, or start fresh.
    let mut history = store.load(&request.release_name).await?;

    // Prepare, config portion. Failures here never touch the ledger.
    let resources = parse_manifests(&request.manifest_yaml, &request.namespace)?;
    let next_number = history.latest_number() + 1;
    let prepared = versioner::prepare(&resources, &request.release_name, next_number, &mode)?;
    let resource_ids: Vec<ResourceId> =
        prepared.resources.iter().map(|r| r.id().clone()).collect();
    let release = history.create_next_release(resource_ids, prepared.managed_workload.clone());
    info!(
        release = %request.release_name,
        number = release.number,
        resources = prepared.resources.len(),
        "starting rollout"
    );

    let mut ctx = RolloutContext {
        release,
        resources: prepared.resources,
        managed_workload: prepared.managed_workload,
        desired_replicas: prepared.desired_replicas,
        pods: None,
    };

    let result = execute(gateway, &mut history, &mut ctx, request).await;
    let (status, error_message) = match result {
        Ok(()) => (ReleaseStatus::Succeeded, None),
        Err(message) => {
            error!(release = %request.release_name, number = ctx.release.number, %message, "rollout failed");
            (ReleaseStatus::Failed, Some(message))
        }
    };

    // Terminal: the outcome is durably recorded before we return it.
    let release_number = ctx.release.number;
    let pods = ctx.pods.take();
    history.record_outcome(ctx.release, status);
    store.save(&request.release_name, &history).await?;
    info!(release = %request.release_name, number = release_number, ?status, "outcome recorded");

    Ok(RolloutOutcome {
        release_number,
        status,
        previous_replica_count: None,
        error: error_message,
        pods,
    })
}

/// Prepare (cluster portion) through WrapUp. Any error short-circuits to the
/// Failed terminal path in the caller.
async fn execute(
    gateway: &dyn ClusterGateway,
    history: &mut ReleaseHistory,
    ctx: &mut RolloutContext,
    request: &RolloutRequest,
) -> Result<(), String> {
    // Prepare: retire releases beyond the retention window before applying.
    cleanup_retired(gateway, history, &ctx.release.resources, request.retention, request).await?;

    // Apply. Partial failure stops here; nothing applied is rolled back.
    let report = gateway.apply(&ctx.resources).await.map_err(|e| format!("apply: {}", e))?;
    if let Some((id, message)) = &report.failed {
        return Err(format!(
            "applying {} failed: {} ({} of {} resources were applied; no automatic rollback is attempted)",
            id.kind_name_ref(),
            message,
            report.applied.len(),
            ctx.resources.len()
        ));
    }

    // WaitSteady.
    match ctx.managed_workload.clone() {
        None => {
            info!(release = %request.release_name, "no managed workload; nothing to wait for");
        }
        Some(workload) => {
            // The cluster's own revision marker, captured at apply time.
            ctx.release.managed_workload_revision =
                gateway.latest_revision(&workload).await.ok().flatten();

            let target = WaitTarget {
                workload: workload.clone(),
                pod_selector: revision_selector(ctx.release.number),
                desired: ctx.desired_replicas,
            };
            match wait_for_steady_state(gateway, &target, request.timeout)
                .await
                .map_err(|e| format!("steady-state check: {}", e))?
            {
                SteadyState::Reached => {
                    ctx.pods = gateway
                        .list_pods(&workload.namespace, &release_selector(&request.release_name))
                        .await
                        .ok();
                }
                SteadyState::TimedOut => {
                    return Err(format!(
                        "workload {} did not reach steady state within {}s",
                        workload,
                        request.timeout.as_secs()
                    ));
                }
            }
        }
    }

    // WrapUp: operator visibility only; failures never fail the release.
    if let Some(workload) = &ctx.managed_workload {
        match gateway.describe(workload).await {
            Ok(text) => info!(workload = %workload, status = %text, "workload status"),
            Err(e) => warn!(workload = %workload, error = %e, "describe failed; continuing"),
        }
    }
    Ok(())
}

/// Retire pruned releases: scale their still-live managed workload to zero,
/// then delete the resources no retained release (and not the incoming one)
/// still references. Shared Services and stable-named workloads survive the
/// set diff; release-unique names (canary copies) fall out of the window.
async fn cleanup_retired(
    gateway: &dyn ClusterGateway,
    history: &mut ReleaseHistory,
    incoming: &[ResourceId],
    keep: usize,
    request: &RolloutRequest,
) -> Result<(), String> {
    let pruned = history.prune_beyond_retention(keep);
    if pruned.is_empty() {
        return Ok(());
    }
    let mut referenced: HashSet<ResourceId> =
        history.referenced_resources().into_iter().cloned().collect();
    referenced.extend(incoming.iter().cloned());

    for release in &pruned {
        info!(number = release.number, "retiring release beyond retention");
        for id in release.resources.iter().rev() {
            if referenced.contains(id) {
                debug!(resource = %id, "still referenced; keeping");
                continue;
            }
            if release.managed_workload.as_ref() == Some(id) {
                match gateway.replica_count(id).await {
                    Ok(live) if live > 0 => {
                        gateway
                            .set_replica_count(id, 0)
                            .await
                            .map_err(|e| format!("downscaling {}: {}", id, e))?;
                        let target = WaitTarget {
                            workload: id.clone(),
                            pod_selector: revision_selector(release.number),
                            desired: 0,
                        };
                        let drained = wait_for_steady_state(gateway, &target, request.timeout)
                            .await
                            .map_err(|e| format!("waiting for {} to drain: {}", id, e))?;
                        if drained == SteadyState::TimedOut {
                            return Err(format!(
                                "retired workload {} did not drain within {}s",
                                id,
                                request.timeout.as_secs()
                            ));
                        }
                    }
                    Ok(_) => {}
                    Err(GatewayError::NotFound(_)) => {
                        debug!(resource = %id, "already gone");
                        continue;
                    }
                    Err(e) => return Err(format!("reading replicas of {}: {}", id, e)),
                }
            }
            gateway
                .delete(std::slice::from_ref(id))
                .await
                .map_err(|e| format!("deleting {}: {}", id, e))?;
        }
    }
    Ok(())
}

async fn run_scale(
    gateway: &dyn ClusterGateway,
    store: &dyn HistoryStore,
    request: &RolloutRequest,
    workload_ref: &str,
    target: ScaleTarget,
    skip_steady_check: bool,
) -> Result<RolloutOutcome, RolloutError> {
    let workload = ResourceId::from_ref(workload_ref, &request.namespace)
        .map_err(|e| RolloutError::Config(e.to_string()))?;
    // The ledger is read for the outcome's release number but not rewritten:
    // scaling mutates a live workload, not the release set.
    let history = store.load(&request.release_name).await?;
    let release_number = history.latest_number();

    let mut previous = None;
    match scale_inner(gateway, &workload, target, skip_steady_check, request, &mut previous).await
    {
        Ok(pods) => Ok(RolloutOutcome {
            release_number,
            status: ReleaseStatus::Succeeded,
            previous_replica_count: previous,
            error: None,
            pods,
        }),
        Err(message) => {
            error!(workload = %workload, %message, "scale failed");
            Ok(RolloutOutcome {
                release_number,
                status: ReleaseStatus::Failed,
                previous_replica_count: previous,
                error: Some(message),
                pods: None,
            })
        }
    }
}

async fn scale_inner(
    gateway: &dyn ClusterGateway,
    workload: &ResourceId,
    target: ScaleTarget,
    skip_steady_check: bool,
    request: &RolloutRequest,
    previous: &mut Option<i32>,
) -> Result<Option<Vec<PodInstance>>, String> {
    let current = gateway
        .replica_count(workload)
        .await
        .map_err(|e| format!("reading replicas of {}: {}", workload, e))?;
    *previous = Some(current);
    let desired = resolve_scale_target(target, current);

    if desired == current {
        info!(workload = %workload, replicas = current, "already at target count");
    } else {
        info!(workload = %workload, from = current, to = desired, "scaling");
        gateway
            .set_replica_count(workload, desired)
            .await
            .map_err(|e| format!("scaling {}: {}", workload, e))?;
    }

    if skip_steady_check {
        info!(workload = %workload, "steady-state check skipped by request");
        return Ok(None);
    }
    let wait_target = WaitTarget {
        workload: workload.clone(),
        pod_selector: release_selector(&request.release_name),
        desired,
    };
    match wait_for_steady_state(gateway, &wait_target, request.timeout)
        .await
        .map_err(|e| format!("steady-state check: {}", e))?
    {
        SteadyState::Reached => Ok(gateway
            .list_pods(&workload.namespace, &release_selector(&request.release_name))
            .await
            .ok()),
        SteadyState::TimedOut => Err(format!(
            "workload {} did not reach steady state within {}s",
            workload,
            request.timeout.as_secs()
        )),
    }
}

fn resolve_scale_target(target: ScaleTarget, current: i32) -> i32 {
    match target {
        ScaleTarget::Count(n) => n,
        ScaleTarget::Percent { percent, max_instances } => {
            let reference = max_instances.unwrap_or(current);
            ((percent as f64) * (reference as f64) / 100.0).round() as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_cluster::{ApplyReport, InstancePhase};
    use skiff_ledger::MemoryStore;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    metadata:
      labels:
        app: web
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
"#;

    struct FakeWorkload {
        replicas: i32,
        pod_labels: HashMap<String, String>,
    }

    #[derive(Default)]
    struct FakeState {
        applied: Vec<ResourceId>,
        deleted: Vec<ResourceId>,
        scale_calls: Vec<(ResourceId, i32)>,
        workloads: HashMap<ResourceId, FakeWorkload>,
        pod_queries: usize,
    }

    /// In-memory cluster: applying a workload makes its pods appear, ready
    /// unless the fake is told otherwise.
    #[derive(Default)]
    struct FakeCluster {
        state: Mutex<FakeState>,
        fail_apply_on: Option<String>,
        fail_describe: bool,
        pods_never_ready: bool,
    }

    impl FakeCluster {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }

        fn template_labels(doc: &serde_json::Value) -> HashMap<String, String> {
            doc.get("spec")
                .and_then(|s| s.get("template"))
                .and_then(|t| t.get("metadata"))
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ClusterGateway for FakeCluster {
        async fn apply(&self, resources: &[Resource]) -> Result<ApplyReport, GatewayError> {
            let mut state = self.state();
            let mut report = ApplyReport::default();
            for resource in resources {
                let id = resource.id().clone();
                if self.fail_apply_on.as_deref() == Some(id.kind_name_ref().as_str()) {
                    report.failed = Some((id, "simulated apply failure".into()));
                    break;
                }
                if resource.is_workload_kind() {
                    state.workloads.insert(
                        id.clone(),
                        FakeWorkload {
                            replicas: resource.replicas().unwrap_or(1),
                            pod_labels: Self::template_labels(resource.doc()),
                        },
                    );
                }
                state.applied.push(id);
            }
            Ok(report)
        }

        async fn describe(&self, id: &ResourceId) -> Result<String, GatewayError> {
            if self.fail_describe {
                return Err(GatewayError::Api("simulated describe failure".into()));
            }
            Ok(format!("{} ok", id.kind_name_ref()))
        }

        async fn replica_count(&self, id: &ResourceId) -> Result<i32, GatewayError> {
            self.state()
                .workloads
                .get(id)
                .map(|w| w.replicas)
                .ok_or_else(|| GatewayError::NotFound(id.kind_name_ref()))
        }

        async fn set_replica_count(&self, id: &ResourceId, replicas: i32) -> Result<(), GatewayError> {
            let mut state = self.state();
            state.scale_calls.push((id.clone(), replicas));
            match state.workloads.get_mut(id) {
                Some(w) => {
                    w.replicas = replicas;
                    Ok(())
                }
                None => Err(GatewayError::NotFound(id.kind_name_ref())),
            }
        }

        async fn list_pods(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<PodInstance>, GatewayError> {
            let mut state = self.state();
            state.pod_queries += 1;
            let (key, value) = label_selector.split_once('=').expect("k=v selector");
            let mut pods = Vec::new();
            for (id, workload) in &state.workloads {
                if id.namespace != namespace {
                    continue;
                }
                if workload.pod_labels.get(key).map(String::as_str) != Some(value) {
                    continue;
                }
                for i in 0..workload.replicas {
                    pods.push(PodInstance {
                        name: format!("{}-{}", id.name, i),
                        namespace: namespace.to_string(),
                        uid: None,
                        phase: InstancePhase::Running,
                        ready: !self.pods_never_ready,
                    });
                }
            }
            Ok(pods)
        }

        async fn delete(&self, ids: &[ResourceId]) -> Result<(), GatewayError> {
            let mut state = self.state();
            for id in ids {
                state.workloads.remove(id);
                state.deleted.push(id.clone());
            }
            Ok(())
        }

        async fn latest_revision(&self, _id: &ResourceId) -> Result<Option<String>, GatewayError> {
            Ok(Some("7".into()))
        }
    }

    fn request(strategy: Strategy, retention: usize) -> RolloutRequest {
        std::env::set_var("SKIFF_POLL_MILLIS", "5");
        RolloutRequest {
            release_name: "demo".into(),
            namespace: "prod".into(),
            manifest_yaml: MANIFESTS.into(),
            strategy,
            timeout: Duration::from_secs(2),
            retention,
        }
    }

    #[tokio::test]
    async fn fresh_rolling_release_succeeds_with_number_one() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();

        let outcome = run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
        assert_eq!(outcome.release_number, 1);
        assert_eq!(outcome.pods.as_ref().map(Vec::len), Some(3));
        assert!(outcome.error.is_none());

        // replica count unchanged from the manifest-declared value
        let web = ResourceId::new("Deployment", "web", "prod");
        assert_eq!(gw.state().workloads[&web].replicas, 3);

        let history = store.load("demo").await.unwrap();
        assert_eq!(history.releases.len(), 1);
        let release = &history.releases[0];
        assert_eq!(release.status, ReleaseStatus::Succeeded);
        assert_eq!(release.managed_workload.as_ref().unwrap(), &web);
        assert_eq!(release.managed_workload_revision.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn second_rolling_release_increments_and_spares_predecessor() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();

        run_rollout(&gw, &store, &request(Strategy::Rolling, 1)).await.unwrap();
        let outcome = run_rollout(&gw, &store, &request(Strategy::Rolling, 1)).await.unwrap();
        assert_eq!(outcome.release_number, 2);

        // release 1 survived the keep=1 window while release 2 was in flight
        let history = store.load("demo").await.unwrap();
        assert_eq!(history.releases.iter().map(|r| r.number).collect::<Vec<_>>(), vec![1, 2]);
        assert!(gw.state().deleted.is_empty());

        // a third run prunes release 1, but its stable-named resources are
        // still referenced and must not be deleted
        run_rollout(&gw, &store, &request(Strategy::Rolling, 1)).await.unwrap();
        let history = store.load("demo").await.unwrap();
        assert_eq!(history.releases.iter().map(|r| r.number).collect::<Vec<_>>(), vec![2, 3]);
        assert!(gw.state().deleted.is_empty());
    }

    #[tokio::test]
    async fn apply_failure_allocates_number_and_records_failed_entry() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();

        let failing = FakeCluster {
            state: Mutex::new(std::mem::take(&mut *gw.state())),
            fail_apply_on: Some("Service/web".into()),
            ..Default::default()
        };
        let queries_before = failing.state().pod_queries;
        let outcome = run_rollout(&failing, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Failed);
        assert_eq!(outcome.release_number, 3);
        let message = outcome.error.unwrap();
        assert!(message.contains("no automatic rollback"), "message={}", message);

        // the handler stopped at Apply: no pods were queried
        assert_eq!(failing.state().pod_queries, queries_before);

        let history = store.load("demo").await.unwrap();
        let last = history.releases.last().unwrap();
        assert_eq!(last.number, 3);
        assert_eq!(last.status, ReleaseStatus::Failed);
    }

    #[tokio::test]
    async fn ambiguous_workloads_fail_before_any_cluster_call() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        let mut req = request(Strategy::Rolling, 2);
        req.manifest_yaml = format!(
            "{}---\napiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\nspec:\n  replicas: 1\n",
            MANIFESTS
        );

        let err = run_rollout(&gw, &store, &req).await.unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
        assert!(gw.state().applied.is_empty());
        assert_eq!(gw.state().pod_queries, 0);
        // nothing was written to the ledger
        assert!(store.load("demo").await.unwrap().releases.is_empty());
    }

    #[tokio::test]
    async fn canary_deploys_copy_and_leaves_primary_alone() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();

        let outcome = run_rollout(&gw, &store, &request(Strategy::Canary { instances: 1 }, 2))
            .await
            .unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
        assert_eq!(outcome.release_number, 2);

        let web = ResourceId::new("Deployment", "web", "prod");
        let canary = ResourceId::new("Deployment", "web-canary", "prod");
        let state = gw.state();
        assert_eq!(state.workloads[&web].replicas, 3, "primary untouched");
        assert_eq!(state.workloads[&canary].replicas, 1);
        drop(state);

        let history = store.load("demo").await.unwrap();
        assert_eq!(history.releases[1].managed_workload.as_ref().unwrap(), &canary);
    }

    #[tokio::test]
    async fn rolling_never_creates_suffixed_resources() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        assert!(gw.state().applied.iter().all(|id| !id.name.ends_with("-canary")));
    }

    #[tokio::test]
    async fn retired_canary_is_drained_then_deleted() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        run_rollout(&gw, &store, &request(Strategy::Canary { instances: 1 }, 2)).await.unwrap();
        // two rolling releases push the canary release out of a keep=1 window
        run_rollout(&gw, &store, &request(Strategy::Rolling, 1)).await.unwrap();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 1)).await.unwrap();

        let web = ResourceId::new("Deployment", "web", "prod");
        let canary = ResourceId::new("Deployment", "web-canary", "prod");
        let state = gw.state();
        assert!(state.scale_calls.contains(&(canary.clone(), 0)), "drained to zero first");
        assert!(state.deleted.contains(&canary));
        assert!(state.workloads.contains_key(&web), "primary survives retirement");
        assert!(!state.workloads.contains_key(&canary));
    }

    #[tokio::test]
    async fn steady_state_timeout_is_a_recorded_failure() {
        let gw = FakeCluster { pods_never_ready: true, ..Default::default() };
        let store = MemoryStore::default();
        let mut req = request(Strategy::Rolling, 2);
        req.timeout = Duration::from_millis(40);

        let outcome = run_rollout(&gw, &store, &req).await.unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Failed);
        assert!(outcome.error.unwrap().contains("steady state"));
        let history = store.load("demo").await.unwrap();
        assert_eq!(history.releases.last().unwrap().status, ReleaseStatus::Failed);
    }

    #[tokio::test]
    async fn manifest_without_workload_skips_the_wait() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        let mut req = request(Strategy::Rolling, 2);
        req.manifest_yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n".into();

        let outcome = run_rollout(&gw, &store, &req).await.unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
        assert!(outcome.pods.is_none());
        assert_eq!(gw.state().pod_queries, 0);
        let history = store.load("demo").await.unwrap();
        assert!(history.releases[0].managed_workload.is_none());
    }

    #[tokio::test]
    async fn describe_failure_does_not_fail_the_release() {
        let gw = FakeCluster { fail_describe: true, ..Default::default() };
        let store = MemoryStore::default();
        let outcome = run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
    }

    #[tokio::test]
    async fn scale_by_percentage_of_current_count() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        let mut seed = request(Strategy::Rolling, 2);
        seed.manifest_yaml = seed.manifest_yaml.replace("replicas: 3", "replicas: 10");
        run_rollout(&gw, &store, &seed).await.unwrap();

        let outcome = run_rollout(
            &gw,
            &store,
            &request(
                Strategy::Scale {
                    workload: "Deployment/web".into(),
                    target: ScaleTarget::Percent { percent: 50, max_instances: None },
                    skip_steady_check: false,
                },
                2,
            ),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
        assert_eq!(outcome.previous_replica_count, Some(10));
        let web = ResourceId::new("Deployment", "web", "prod");
        assert!(gw.state().scale_calls.contains(&(web.clone(), 5)));
        assert_eq!(gw.state().workloads[&web].replicas, 5);
    }

    #[tokio::test]
    async fn scale_to_current_count_is_a_noop_that_succeeds() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        run_rollout(&gw, &store, &request(Strategy::Rolling, 2)).await.unwrap();

        let outcome = run_rollout(
            &gw,
            &store,
            &request(
                Strategy::Scale {
                    workload: "Deployment/web".into(),
                    target: ScaleTarget::Count(3),
                    skip_steady_check: false,
                },
                2,
            ),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ReleaseStatus::Succeeded);
        assert_eq!(outcome.previous_replica_count, Some(3));
        assert!(gw.state().scale_calls.is_empty());
    }

    #[tokio::test]
    async fn scale_missing_workload_is_a_failed_outcome() {
        let gw = FakeCluster::default();
        let store = MemoryStore::default();
        let outcome = run_rollout(
            &gw,
            &store,
            &request(
                Strategy::Scale {
                    workload: "Deployment/ghost".into(),
                    target: ScaleTarget::Count(2),
                    skip_steady_check: true,
                },
                2,
            ),
        )
        .await
        .unwrap();
        assert_eq!(outcome.status, ReleaseStatus::Failed);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[test]
    fn percentage_targets_round_half_up() {
        let pct = |percent, max, current| {
            resolve_scale_target(ScaleTarget::Percent { percent, max_instances: max }, current)
        };
        assert_eq!(pct(50, None, 10), 5);
        assert_eq!(pct(50, Some(8), 10), 4);
        assert_eq!(pct(50, None, 5), 3);
        assert_eq!(pct(0, None, 5), 0);
        assert_eq!(resolve_scale_target(ScaleTarget::Count(7), 3), 7);
    }
}
