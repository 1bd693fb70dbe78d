//! Skiff resource model: typed identity over raw manifest documents.
//!
//! A `Resource` owns the full structured document as parsed; mutation helpers
//! are pure (each returns a new `Resource`) and must preserve fields they do
//! not understand.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

/// Well-known label/annotation keys stamped onto managed resources.
pub mod keys {
    /// Label carrying the release name; also the pod selector for snapshots.
    pub const RELEASE_NAME: &str = "skiff.io/release-name";
    /// Label/annotation carrying the release number a resource belongs to.
    pub const RELEASE_NUMBER: &str = "skiff.io/release-number";
    /// Annotation opting a resource out of versioning and managed tracking.
    pub const DIRECT_APPLY: &str = "skiff.io/direct-apply";
}

/// Kinds whose spec carries a replica count and that are eligible to be the
/// managed workload of a release.
pub const WORKLOAD_KINDS: [&str; 4] = ["Deployment", "StatefulSet", "ReplicaSet", "DeploymentConfig"];

fn max_manifest_bytes() -> usize {
    std::env::var("SKIFF_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("parsing YAML document {index}: {source}")]
    Yaml {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document {index} missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("document {index} is not a valid object")]
    Invalid { index: usize },
    #[error("invalid resource reference {0} (expect Kind/name)")]
    BadRef(String),
}

/// Immutable identity of one cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.into() }
    }

    /// Canonical `Kind/name` reference used in logs and for diffing resource
    /// sets between releases.
    pub fn kind_name_ref(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Parse a literal `Kind/name` reference (the scale target syntax).
    pub fn from_ref(kind_name: &str, namespace: &str) -> Result<Self, ManifestError> {
        match kind_name.split('/').collect::<Vec<_>>().as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(*kind, *name, namespace))
            }
            _ => Err(ManifestError::BadRef(kind_name.to_string())),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// One manifest document plus its identity. The raw document is kept verbatim;
/// helpers only touch the fields they are about.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    id: ResourceId,
    doc: Json,
}

impl Resource {
    pub fn from_doc(doc: Json, default_namespace: &str, index: usize) -> Result<Self, ManifestError> {
        let kind = doc
            .get("kind")
            .and_then(Json::as_str)
            .ok_or(ManifestError::MissingField { index, field: "kind" })?
            .to_string();
        let name = doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Json::as_str)
            .ok_or(ManifestError::MissingField { index, field: "metadata.name" })?
            .to_string();
        let namespace = doc
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Json::as_str)
            .unwrap_or(default_namespace)
            .to_string();
        let mut doc = doc;
        ensure_metadata_field(&mut doc, "namespace", &namespace);
        Ok(Self { id: ResourceId::new(kind, name, namespace), doc })
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn doc(&self) -> &Json {
        &self.doc
    }

    pub fn into_doc(self) -> Json {
        self.doc
    }

    pub fn api_version(&self) -> &str {
        self.doc.get("apiVersion").and_then(Json::as_str).unwrap_or("v1")
    }

    pub fn is_workload_kind(&self) -> bool {
        WORKLOAD_KINDS.contains(&self.id.kind.as_str())
    }

    pub fn is_direct_apply(&self) -> bool {
        self.doc
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(keys::DIRECT_APPLY))
            .and_then(Json::as_str)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Declared replica count, if the kind carries one.
    pub fn replicas(&self) -> Option<i32> {
        if !self.is_workload_kind() {
            return None;
        }
        self.doc
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(Json::as_i64)
            .map(|n| n as i32)
    }

    /// New resource with `metadata.labels[key] = value`.
    pub fn with_label(&self, key: &str, value: &str) -> Resource {
        let mut doc = self.doc.clone();
        insert_at(&mut doc, &["metadata", "labels"], key, value);
        Resource { id: self.id.clone(), doc }
    }

    /// New resource with `metadata.annotations[key] = value`.
    pub fn with_annotation(&self, key: &str, value: &str) -> Resource {
        let mut doc = self.doc.clone();
        insert_at(&mut doc, &["metadata", "annotations"], key, value);
        Resource { id: self.id.clone(), doc }
    }

    /// New resource with a label added to the pod template. No-op for kinds
    /// without a `spec.template`.
    pub fn with_pod_template_label(&self, key: &str, value: &str) -> Resource {
        if self.doc.get("spec").and_then(|s| s.get("template")).is_none() {
            return self.clone();
        }
        let mut doc = self.doc.clone();
        insert_at(&mut doc, &["spec", "template", "metadata", "labels"], key, value);
        Resource { id: self.id.clone(), doc }
    }

    /// New resource with `spec.replicas = n`. No-op for kinds without a
    /// replica-count field.
    pub fn with_replicas(&self, n: i32) -> Resource {
        if !self.is_workload_kind() {
            return self.clone();
        }
        let mut doc = self.doc.clone();
        if let Some(spec) = ensure_object(&mut doc, "spec") {
            spec.insert("replicas".into(), Json::from(n));
        }
        Resource { id: self.id.clone(), doc }
    }

    /// New resource whose name (and identity) carries `suffix`. Used to stand
    /// up a parallel canary copy without colliding with the primary workload.
    pub fn clone_with_suffix(&self, suffix: &str) -> Resource {
        let name = format!("{}{}", self.id.name, suffix);
        let mut doc = self.doc.clone();
        ensure_metadata_field(&mut doc, "name", &name);
        Resource { id: ResourceId::new(self.id.kind.clone(), name, self.id.namespace.clone()), doc }
    }
}

/// Parse a multi-document YAML manifest set into resources. Empty documents
/// are skipped; anything malformed fails the whole set.
pub fn parse_manifests(yaml: &str, default_namespace: &str) -> Result<Vec<Resource>, ManifestError> {
    if yaml.len() > max_manifest_bytes() {
        return Err(ManifestError::TooLarge(max_manifest_bytes()));
    }
    let mut out = Vec::new();
    for (index, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value =
            serde_yaml::Value::deserialize(de).map_err(|source| ManifestError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).map_err(|_| ManifestError::Invalid { index })?;
        out.push(Resource::from_doc(json, default_namespace, index)?);
    }
    Ok(out)
}

fn ensure_metadata_field(doc: &mut Json, field: &str, value: &str) {
    if let Some(meta) = ensure_object(doc, "metadata") {
        meta.insert(field.into(), Json::String(value.to_string()));
    }
}

fn ensure_object<'a>(doc: &'a mut Json, key: &str) -> Option<&'a mut serde_json::Map<String, Json>> {
    doc.as_object_mut()?
        .entry(key.to_string())
        .or_insert_with(|| Json::Object(serde_json::Map::new()))
        .as_object_mut()
}

fn insert_at(doc: &mut Json, path: &[&str], key: &str, value: &str) {
    let mut cur = doc;
    for seg in path {
        let Some(obj) = cur.as_object_mut() else { return };
        cur = obj
            .entry(seg.to_string())
            .or_insert_with(|| Json::Object(serde_json::Map::new()));
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(key.into(), Json::String(value.to_string()));
    }
}
