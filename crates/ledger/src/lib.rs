//! Skiff release ledger: append-only, versioned history of releases for one
//! release name, persisted as a single YAML blob behind a get/put store.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use skiff_model::ResourceId;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("encoding release history: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("history storage: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// One numbered deployment attempt. Immutable once its status turns terminal;
/// after that it is only ever superseded, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub number: u32,
    pub resources: Vec<ResourceId>,
    pub managed_workload: Option<ResourceId>,
    /// The cluster's own revision marker for the managed workload, captured
    /// at apply time.
    pub managed_workload_revision: Option<String>,
    pub status: ReleaseStatus,
    pub created_at: String,
}

/// Ordered history (newest last) of releases under one release name.
///
/// Numbers are strictly increasing while the window is retained. At most one
/// release is in flight per release name; that serialization is enforced by
/// the calling pipeline, not re-checked here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseHistory {
    pub releases: Vec<Release>,
}

impl ReleaseHistory {
    /// Allocate the next release: `max(existing numbers, 0) + 1`. Status
    /// starts `InProgress`; the caller records the terminal outcome after the
    /// rollout attempt completes.
    pub fn create_next_release(
        &self,
        resources: Vec<ResourceId>,
        managed_workload: Option<ResourceId>,
    ) -> Release {
        let number = self.latest_number() + 1;
        Release {
            number,
            resources,
            managed_workload,
            managed_workload_revision: None,
            status: ReleaseStatus::InProgress,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn latest_number(&self) -> u32 {
        self.releases.iter().map(|r| r.number).max().unwrap_or(0)
    }

    /// Most recent release with status `Succeeded`. Iterating newest-first
    /// also settles the defensive tie-break: if two entries were ever
    /// persisted with the same number, the later-appearing one wins.
    pub fn last_successful(&self) -> Option<&Release> {
        self.releases.iter().rev().find(|r| r.status == ReleaseStatus::Succeeded)
    }

    /// Append the now-terminal release.
    pub fn record_outcome(&mut self, mut release: Release, status: ReleaseStatus) {
        release.status = status;
        self.releases.push(release);
    }

    /// Remove and return releases older than the `keep` most recent. The most
    /// recent Succeeded release is always retained: it is the rollback target
    /// even when it falls outside the window.
    pub fn prune_beyond_retention(&mut self, keep: usize) -> Vec<Release> {
        if self.releases.len() <= keep {
            return Vec::new();
        }
        let protected = self.last_successful().map(|r| r.number);
        let cutoff = self.releases.len() - keep;
        let mut pruned = Vec::new();
        let mut kept = Vec::new();
        for (i, release) in std::mem::take(&mut self.releases).into_iter().enumerate() {
            if i < cutoff && Some(release.number) != protected {
                pruned.push(release);
            } else {
                kept.push(release);
            }
        }
        self.releases = kept;
        pruned
    }

    /// Resource ids referenced by any retained release. Pruning uses this to
    /// avoid deleting objects a live release still points at.
    pub fn referenced_resources(&self) -> HashSet<&ResourceId> {
        self.releases.iter().flat_map(|r| r.resources.iter()).collect()
    }

    pub fn to_yaml(&self) -> Result<String, LedgerError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(blob: &str) -> Result<Self, LedgerError> {
        Ok(serde_yaml::from_str(blob)?)
    }
}

/// Durable get/put of one history blob per release name. The storage layer
/// enforces no schema; `save` is a blind last-writer-wins overwrite. Callers
/// must not run two rollouts for the same release name concurrently.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Returns an empty-but-valid history when none exists; absence is never
    /// an error.
    async fn load(&self, release_name: &str) -> Result<ReleaseHistory, LedgerError>;
    async fn save(&self, release_name: &str, history: &ReleaseHistory) -> Result<(), LedgerError>;
}

const HISTORY_KEY: &str = "releaseHistory";

/// ConfigMap-backed store: the history YAML lives under a `releaseHistory`
/// data key in a ConfigMap named after the release.
pub struct ConfigMapStore {
    client: kube::Client,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    fn api(&self) -> kube::Api<k8s_openapi::api::core::v1::ConfigMap> {
        kube::Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn storage_err(e: kube::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl HistoryStore for ConfigMapStore {
    async fn load(&self, release_name: &str) -> Result<ReleaseHistory, LedgerError> {
        let t0 = std::time::Instant::now();
        let found = self.api().get_opt(release_name).await.map_err(storage_err)?;
        histogram!("ledger_load_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let blob = found.and_then(|cm| cm.data.and_then(|d| d.get(HISTORY_KEY).cloned()));
        match blob {
            Some(blob) => ReleaseHistory::from_yaml(&blob),
            None => Ok(ReleaseHistory::default()),
        }
    }

    async fn save(&self, release_name: &str, history: &ReleaseHistory) -> Result<(), LedgerError> {
        use k8s_openapi::api::core::v1::ConfigMap;
        use kube::api::PostParams;

        let t0 = std::time::Instant::now();
        let blob = history.to_yaml()?;
        let api = self.api();
        let pp = PostParams::default();
        match api.get_opt(release_name).await.map_err(storage_err)? {
            Some(mut cm) => {
                cm.data.get_or_insert_with(Default::default).insert(HISTORY_KEY.into(), blob);
                api.replace(release_name, &pp, &cm).await.map_err(storage_err)?;
            }
            None => {
                let cm = ConfigMap {
                    metadata: kube::core::ObjectMeta {
                        name: Some(release_name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some([(HISTORY_KEY.to_string(), blob)].into()),
                    ..Default::default()
                };
                api.create(&pp, &cm).await.map_err(storage_err)?;
            }
        }
        histogram!("ledger_save_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("ledger_save_total", 1u64);
        Ok(())
    }
}

/// In-process store for tests and dry runs. Blobs are kept serialized so the
/// round-trip path is exercised the same way the ConfigMap driver does it.
#[derive(Default)]
pub struct MemoryStore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[async_trait::async_trait]
impl HistoryStore for MemoryStore {
    async fn load(&self, release_name: &str) -> Result<ReleaseHistory, LedgerError> {
        match self.blobs.lock().unwrap().get(release_name) {
            Some(blob) => ReleaseHistory::from_yaml(blob),
            None => Ok(ReleaseHistory::default()),
        }
    }

    async fn save(&self, release_name: &str, history: &ReleaseHistory) -> Result<(), LedgerError> {
        let blob = history.to_yaml()?;
        let prev = self.blobs.lock().unwrap().insert(release_name.to_string(), blob);
        if prev.is_some() {
            warn!(release = %release_name, "overwriting stored history (last writer wins)");
        }
        Ok(())
    }
}
