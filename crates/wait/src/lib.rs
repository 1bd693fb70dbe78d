//! Skiff steady-state poller: a fixed-interval, deadline-bounded loop that
//! decides when an applied workload has reached its desired running state.
//!
//! The loop deliberately blocks the invoking task; a rollout is serialized
//! per release name and there is no external cancel signal. The overall
//! `timeout` is the only bound.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::counter;
use skiff_cluster::{ClusterGateway, GatewayError};
use skiff_model::ResourceId;
use tracing::{info, warn};

fn poll_interval() -> Duration {
    let millis = std::env::var("SKIFF_POLL_MILLIS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(5_000);
    Duration::from_millis(millis)
}

/// What to wait for: a workload, the label selector matching its pods, and
/// the replica count it should settle at.
#[derive(Debug, Clone)]
pub struct WaitTarget {
    pub workload: ResourceId,
    pub pod_selector: String,
    pub desired: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteadyState {
    Reached,
    /// The deadline elapsed first. Not an error; callers decide what a
    /// timeout means for the attempt.
    TimedOut,
}

/// Poll until the target is steady or `timeout` elapses.
///
/// Steady means: the live replica count equals `desired` and every instance
/// is terminally provisioned (ran to completion, or running and ready). A
/// desired count of zero is the downscale case and succeeds as soon as the
/// instance list is empty.
pub async fn wait_for_steady_state(
    gateway: &dyn ClusterGateway,
    target: &WaitTarget,
    timeout: Duration,
) -> Result<SteadyState, GatewayError> {
    let deadline = Instant::now() + timeout;
    let interval = poll_interval();
    info!(
        workload = %target.workload,
        desired = target.desired,
        timeout_secs = timeout.as_secs(),
        "waiting for steady state"
    );

    loop {
        counter!("wait_ticks_total", 1u64);
        let pods = gateway
            .list_pods(&target.workload.namespace, &target.pod_selector)
            .await?;

        if target.desired == 0 {
            if pods.is_empty() {
                info!(workload = %target.workload, "scaled down to zero");
                return Ok(SteadyState::Reached);
            }
            for pod in &pods {
                info!(pod = %pod.name, phase = ?pod.phase, "still terminating");
            }
        } else {
            let observed = gateway.replica_count(&target.workload).await?;
            let provisioned = pods.iter().filter(|p| p.is_provisioned()).count();
            for pod in &pods {
                info!(pod = %pod.name, phase = ?pod.phase, ready = pod.ready, "instance status");
            }
            info!(
                workload = %target.workload,
                observed,
                desired = target.desired,
                provisioned,
                instances = pods.len(),
                "steady-state tick"
            );
            if observed == target.desired
                && pods.len() as i32 == target.desired
                && pods.iter().all(|p| p.is_provisioned())
            {
                info!(workload = %target.workload, "steady state reached");
                return Ok(SteadyState::Reached);
            }
        }

        if Instant::now() >= deadline {
            warn!(workload = %target.workload, "steady state not reached before deadline");
            counter!("wait_timeouts_total", 1u64);
            return Ok(SteadyState::TimedOut);
        }
        tokio::time::sleep(interval).await;
    }
}
