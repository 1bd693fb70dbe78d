//! Resource versioner: stamp a manifest set with its release identity and
//! shape it for the chosen deploy mode.

use skiff_model::{keys, Resource, ResourceId};
use tracing::info;

use crate::RolloutError;

/// Name suffix of the parallel canary copy.
pub const CANARY_SUFFIX: &str = "-canary";

#[derive(Debug, Clone)]
pub enum VersionMode {
    /// Mutate the managed workload in place: the object name stays stable and
    /// the revision label on the pod template distinguishes old and new pods.
    Rolling,
    /// Stand up a separately-named, separately-sized copy of the managed
    /// workload; the live primary is left alone until promotion.
    Canary { instances: i32 },
}

/// A manifest set rewritten for one release.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub resources: Vec<Resource>,
    pub managed_workload: Option<ResourceId>,
    /// Replica count the steady-state wait should settle at. Zero when there
    /// is no managed workload.
    pub desired_replicas: i32,
}

/// Rewrite `resources` for release `number` under `mode`.
///
/// Exactly one managed-workload candidate is allowed for rolling/canary;
/// more than one is a fatal configuration error raised before any cluster
/// call. None at all is fine: the steady-state wait is skipped.
pub fn prepare(
    resources: &[Resource],
    release_name: &str,
    number: u32,
    mode: &VersionMode,
) -> Result<Prepared, RolloutError> {
    let candidates: Vec<&Resource> = resources
        .iter()
        .filter(|r| r.is_workload_kind() && !r.is_direct_apply())
        .collect();
    if candidates.len() > 1 {
        let refs: Vec<String> = candidates.iter().map(|r| r.id().kind_name_ref()).collect();
        return Err(RolloutError::Config(format!(
            "found {} managed workload candidates ({}); exactly one is required",
            candidates.len(),
            refs.join(", ")
        )));
    }
    let managed_id = candidates.first().map(|r| r.id().clone());

    let number_str = number.to_string();
    let mut out: Vec<Resource> = Vec::with_capacity(resources.len());
    for resource in resources {
        if resource.is_direct_apply() {
            out.push(resource.clone());
            continue;
        }
        out.push(
            resource
                .with_label(keys::RELEASE_NAME, release_name)
                .with_label(keys::RELEASE_NUMBER, &number_str)
                .with_annotation(keys::RELEASE_NUMBER, &number_str),
        );
    }

    let Some(managed_id) = managed_id else {
        info!(release = %release_name, number, "no managed workload in manifest set");
        return Ok(Prepared { resources: out, managed_workload: None, desired_replicas: 0 });
    };
    let idx = out
        .iter()
        .position(|r| r.id() == &managed_id)
        .expect("managed workload present in rewritten set");

    match mode {
        VersionMode::Rolling => {
            let desired = out[idx].replicas().unwrap_or(1);
            out[idx] = out[idx]
                .with_pod_template_label(keys::RELEASE_NAME, release_name)
                .with_pod_template_label(keys::RELEASE_NUMBER, &number_str);
            Ok(Prepared { resources: out, managed_workload: Some(managed_id), desired_replicas: desired })
        }
        VersionMode::Canary { instances } => {
            // The applied set carries the canary copy instead of the primary;
            // the primary keeps running untouched.
            let canary = out[idx]
                .clone_with_suffix(CANARY_SUFFIX)
                .with_replicas(*instances)
                .with_pod_template_label(keys::RELEASE_NAME, release_name)
                .with_pod_template_label(keys::RELEASE_NUMBER, &number_str);
            let canary_id = canary.id().clone();
            out[idx] = canary;
            Ok(Prepared {
                resources: out,
                managed_workload: Some(canary_id),
                desired_replicas: *instances,
            })
        }
    }
}
