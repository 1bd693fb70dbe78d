//! Skiff rollout orchestrator.
//!
//! A strategy handler turns a rendered manifest set into a tracked, numbered
//! release against the live cluster: version the resources, apply, wait for
//! steady state, record the outcome, retire releases beyond retention. One
//! shared state machine drives all strategies; the strategy itself is a
//! closed sum type matched once at the entry point.

#![forbid(unsafe_code)]

mod driver;
mod versioner;

pub use driver::run_rollout;
pub use versioner::{prepare, Prepared, VersionMode, CANARY_SUFFIX};

use serde::Serialize;
use skiff_cluster::{GatewayError, PodInstance};
use skiff_ledger::{LedgerError, ReleaseStatus};
use skiff_model::{keys, ManifestError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Fatal, non-retryable problem with the manifest set or the request.
    /// Surfaced before anything is written to the ledger.
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// How to compute the scale target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleTarget {
    /// Absolute replica count.
    Count(i32),
    /// `round(percent * reference / 100)`, reference being the supplied max
    /// or, when absent, the live current replica count.
    Percent { percent: u32, max_instances: Option<i32> },
}

/// Strategy-specific parameters, matched once at the entry point.
#[derive(Debug, Clone)]
pub enum Strategy {
    Rolling,
    Canary {
        /// Replica count for the parallel canary copy.
        instances: i32,
    },
    Scale {
        /// Literal `Kind/name` reference of the workload to scale.
        workload: String,
        target: ScaleTarget,
        skip_steady_check: bool,
    },
}

/// One rollout invocation. The manifest set arrives already rendered;
/// fetching and templating happen upstream.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub release_name: String,
    pub namespace: String,
    /// Multi-document YAML. Unused (may be empty) for `Strategy::Scale`.
    pub manifest_yaml: String,
    pub strategy: Strategy,
    pub timeout: std::time::Duration,
    /// Number of most-recent releases whose cluster resources stay alive.
    pub retention: usize,
}

/// Result value returned to the caller. Terminal outcomes are durably
/// recorded in the ledger before this is returned.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutOutcome {
    pub release_number: u32,
    pub status: ReleaseStatus,
    pub previous_replica_count: Option<i32>,
    pub error: Option<String>,
    pub pods: Option<Vec<PodInstance>>,
}

/// Label selector matching all pods of a release name.
pub fn release_selector(release_name: &str) -> String {
    format!("{}={}", keys::RELEASE_NAME, release_name)
}

/// Label selector matching pods of one numbered revision.
pub fn revision_selector(number: u32) -> String {
    format!("{}={}", keys::RELEASE_NUMBER, number)
}
