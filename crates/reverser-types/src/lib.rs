//! Shared domain types for GitOps Reverser.
//!
//! This crate defines the entities from the data model: [`Provider`],
//! [`Target`], [`WatchRule`], [`CapturedEvent`], and the status
//! [`Condition`] types surfaced on Target/Provider objects. Every other
//! crate in the workspace depends on this one; it has no dependency on
//! anything Kubernetes-specific so it can be unit tested in isolation.
//!
//! # Example
//!
//! ```
//! use reverser_types::{GroupVersionResource, ObjectIdentifier};
//!
//! let gvr = GroupVersionResource::new("", "v1", "configmaps");
//! let id = ObjectIdentifier::namespaced(gvr, "team", "cm-a");
//! assert_eq!(id.name, "cm-a");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Kubernetes API operation relevant to admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Short tag used in commit message subjects, e.g. `[CREATE]`.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// The (operation, group, version, resource) tuple the Rule Store indexes
/// rules by, and that the Path Parser's first three path segments encode.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupVersionResource {
    /// API group. Empty string for the core group.
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `configmaps`.
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// Whether this GVR belongs to the core API group.
    pub fn is_core_group(&self) -> bool {
        self.group.is_empty()
    }
}

/// Identifies one resource instance on the cluster or on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    pub gvr: GroupVersionResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectIdentifier {
    pub fn namespaced(gvr: GroupVersionResource, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvr,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(gvr: GroupVersionResource, name: impl Into<String>) -> Self {
        Self {
            gvr,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespace.is_some()
    }
}

/// An opaque, partially-typed view over a decoded API object.
///
/// Admission payloads are never deserialized into a concrete Kubernetes
/// type in this workspace — only the handful of fields the pipeline
/// actually needs are exposed as typed accessors, backed by a
/// `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredDocument(serde_json::Value);

impl StructuredDocument {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(|v| v.as_str())
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(|v| v.as_str())
    }

    /// Splits `apiVersion` into (group, version); core group renders as `""`.
    pub fn group_version(&self) -> Option<(String, String)> {
        let api_version = self.api_version()?;
        match api_version.split_once('/') {
            Some((group, version)) => Some((group.to_string(), version.to_string())),
            None => Some((String::new(), api_version.to_string())),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("metadata")?.get("name")?.as_str()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.get("metadata")?.get("namespace")?.as_str()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.0.get("metadata")
    }

    pub fn status(&self) -> Option<&serde_json::Value> {
        self.0.get("status")
    }

    pub fn get_path<'a>(&'a self, path: &[&str]) -> Option<&'a serde_json::Value> {
        let mut cur = &self.0;
        for segment in path {
            cur = cur.get(segment)?;
        }
        Some(cur)
    }
}

/// Identity of the user who triggered an admission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Credentials reference for a [`Provider`]'s Git endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CredentialsRef {
    /// SSH private key plus known-hosts, both sourced from a named secret.
    Ssh {
        secret_name: String,
        private_key_key: String,
        known_hosts_key: String,
    },
    /// HTTP token sourced from a named secret.
    HttpToken {
        secret_name: String,
        token_key: String,
    },
}

/// Configured push batching behavior for a provider's workers:
/// `{interval, maxCommits}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPolicy {
    #[serde(with = "humantime_serde_compat")]
    pub interval: std::time::Duration,
    pub max_commits: u32,
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            max_commits: 20,
        }
    }
}

/// Minimal humantime-compatible (de)serialization kept dependency-free in
/// this crate; `reverser-config` re-exports the full `humantime_serde`
/// crate for user-facing configuration parsing.
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// A Git endpoint a Target can point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    /// Canonical URL: lowercased host/path, `.git` suffix and trailing
    /// slash stripped. Use [`normalize_repo_url`] to produce this.
    pub canonical_url: String,
    pub credentials: CredentialsRef,
    #[serde(default)]
    pub push_policy: PushPolicy,
    /// Branch allow-list glob patterns (e.g. `["main", "release/*"]`).
    /// Empty means all branches are allowed.
    #[serde(default)]
    pub allowed_branches: Vec<String>,
}

impl Provider {
    /// Whether `branch` is allowed by this provider's allow-list. An empty
    /// list allows every branch. Patterns are glob patterns matched against
    /// the whole branch name (e.g. `release/*` matches `release/1.2` but
    /// not `release`).
    pub fn allows_branch(&self, branch: &str) -> bool {
        if self.allowed_branches.is_empty() {
            return true;
        }
        self.allowed_branches.iter().any(|pattern| {
            glob::Pattern::new(pattern).is_ok_and(|compiled| compiled.matches(branch))
        })
    }
}

/// Normalizes a Git repository URL for identity comparisons: lowercases
/// host and path, strips a trailing `.git`, strips a trailing `/`.
pub fn normalize_repo_url(url: &str) -> String {
    let mut s = url.trim().to_ascii_lowercase();
    if let Some(stripped) = s.strip_suffix('/') {
        s = stripped.to_string();
    }
    if let Some(stripped) = s.strip_suffix(".git") {
        s = stripped.to_string();
    }
    s
}

/// Encryption behavior opted into by a Target for secret-class resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEncryption {
    pub enabled: bool,
    /// Name of the pluggable encryptor to use (e.g. `"aes-gcm"`,
    /// `"external"`). Resolved by the embedder, not by this crate.
    #[serde(default)]
    pub encryptor: Option<String>,
}

/// A (Provider, branch, base-path, optional-encryption) destination.
///
/// Invariant: the 3-tuple (normalized provider URL, branch, base path) is
/// globally unique among Ready targets; see [`TargetKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub provider: String,
    pub branch: String,
    pub base_path: String,
    #[serde(default)]
    pub encryption: Option<TargetEncryption>,
    pub created_at: DateTime<Utc>,
}

/// The uniqueness key for a Target: normalized provider URL + branch + base path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub normalized_repo_url: String,
    pub branch: String,
    pub base_path: String,
}

impl TargetKey {
    pub fn new(normalized_repo_url: impl Into<String>, branch: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            normalized_repo_url: normalized_repo_url.into(),
            branch: branch.into(),
            base_path: base_path.into(),
        }
    }
}

/// A key/value label selector requirement (`In`/`NotIn`/`Exists`/`DoesNotExist`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "PascalCase")]
pub enum LabelSelectorRequirement {
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelSelectorRequirement::In { key, values } => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            LabelSelectorRequirement::NotIn { key, values } => {
                !labels.get(key).is_some_and(|v| values.contains(v))
            }
            LabelSelectorRequirement::Exists { key } => labels.contains_key(key),
            LabelSelectorRequirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

/// Label selector: all requirements and all `match_labels` must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let match_labels_ok = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));
        let expressions_ok = self.match_expressions.iter().all(|req| req.matches(labels));
        match_labels_ok && expressions_ok
    }
}

/// One resource selector inside a [`WatchRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSelector {
    pub operations: Vec<Operation>,
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
}

/// Namespace scoping for a [`WatchRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum WatchScope {
    /// Matches only within the given namespace.
    Namespaced { namespace: String },
    /// No namespace restriction.
    Cluster,
}

/// A set of resource selectors bound to exactly one Target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRule {
    pub id: String,
    pub target_id: String,
    pub scope: WatchScope,
    pub selectors: Vec<ResourceSelector>,
}

/// A flattened (operation, group, version, resource) tuple produced when a
/// [`WatchRule`] is expanded for O(1) lookup by the Rule Store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlatRuleKey {
    pub operation: Operation,
    pub gvr: GroupVersionResource,
}

/// A match result returned by the Rule Store, carrying the Target identity
/// used by the Event Router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleBinding {
    pub rule_id: String,
    pub target_id: String,
}

/// An immutable record of one admitted, rule-matched mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub operation: Operation,
    pub identifier: ObjectIdentifier,
    /// The sanitized object. `None` for DELETE, where only the identifier
    /// is needed to remove the corresponding file.
    pub object: Option<StructuredDocument>,
    pub user: UserInfo,
    pub target_id: String,
    pub admitted_at: DateTime<Utc>,
}

/// Status of a boolean condition, mirroring `metav1.ConditionStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A Target/Provider status condition: `Ready=False`, `SyncStatus=Error`,
/// `WorkerHealthy`, etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn ready(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: "Ready".to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    pub fn conflict(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::ready(ConditionStatus::False, "Conflict", message, now)
    }

    pub fn sync_status(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: "SyncStatus".to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    pub fn worker_healthy(healthy: bool, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: "WorkerHealthy".to_string(),
            status: if healthy { ConditionStatus::True } else { ConditionStatus::False },
            reason: if healthy { "Synced".to_string() } else { "PushFailing".to_string() },
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Errors shared across the workspace for failures that originate from
/// malformed domain data rather than I/O.
#[derive(Debug, thiserror::Error)]
pub enum ReverserError {
    #[error("invalid repo-relative path: {0}")]
    InvalidPath(String),
    #[error("duplicate target key {0:?}")]
    DuplicateTarget(TargetKey),
    #[error("unknown target id {0}")]
    UnknownTarget(String),
}
