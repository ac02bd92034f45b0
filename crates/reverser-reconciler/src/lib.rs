//! Folder Reconciler.
//!
//! Computes the delta between live-cluster state and the on-disk contents
//! of a Target's base path, and turns that delta into the same
//! [`reverser_worker::ReconcileChange`] shape a live admission event would
//! produce. The Branch Worker calls this on its periodic reconcile tick
//! and replays the output through its normal event path, so a live DELETE
//! racing a reconcile can never be followed by a stale UPSERT.
//!
//! Walking the working tree is deliberately scoped to `<clone>/<base>`,
//! never the clone root — joining via [`Path::join`] rather than string
//! prefix matching is what keeps a base of `live/` from ever being
//! confused with a sibling directory like `live2/`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use reverser_sanitizer::sanitize;
use reverser_types::{GroupVersionResource, LabelSelector, ObjectIdentifier, Operation, StructuredDocument, WatchRule, WatchScope};
use reverser_worker::ReconcileChange;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("cluster listing for {0:?} failed: {1}")]
    Backend(GroupVersionResource, String),
}

/// One object the cluster lister reports, with enough detail for the
/// reconciler to filter it through a rule's label selector and sanitize
/// it before emitting an UPSERT.
pub struct ListedObject {
    pub identifier: ObjectIdentifier,
    pub labels: BTreeMap<String, String>,
    pub object: StructuredDocument,
}

/// Injected by the assembler: enumerates live objects of one resource
/// type, optionally restricted to a namespace.
pub trait ClusterLister: Send + Sync {
    fn list(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Result<Vec<ListedObject>, ListError>;
}

/// Reconciles one Target's base path against the set of [`WatchRule`]s
/// bound to it. Only acts on objects a current rule would admit: every
/// listed object is passed back through its rule's label selector before
/// being considered live.
pub struct TargetReconciler {
    lister: Arc<dyn ClusterLister>,
    rules: Vec<WatchRule>,
}

impl TargetReconciler {
    pub fn new(lister: Arc<dyn ClusterLister>, rules: Vec<WatchRule>) -> Self {
        Self { lister, rules }
    }

    /// Produce the synthetic changes for one base path: `clone_dir` is the
    /// worker's clone root, `base_path` the Target's configured base.
    pub fn reconcile(&self, clone_dir: &Path, base_path: &str) -> Vec<ReconcileChange> {
        let on_disk = walk_disk(clone_dir, base_path);
        let live = self.list_live();

        let mut changes = Vec::new();
        for (identifier, _path) in &on_disk {
            if !live.contains_key(identifier) {
                changes.push(ReconcileChange {
                    operation: Operation::Delete,
                    identifier: identifier.clone(),
                    object: None,
                });
            }
        }
        for (identifier, listed) in &live {
            if !on_disk.contains_key(identifier) {
                changes.push(ReconcileChange {
                    operation: Operation::Update,
                    identifier: identifier.clone(),
                    object: Some(sanitize(&listed.object)),
                });
            }
        }
        changes
    }

    fn list_live(&self) -> HashMap<ObjectIdentifier, ListedObject> {
        let mut live = HashMap::new();
        for rule in &self.rules {
            for selector in &rule.selectors {
                let gvr = GroupVersionResource::new(selector.group.clone(), selector.version.clone(), selector.resource.clone());
                let namespace = match &rule.scope {
                    WatchScope::Namespaced { namespace } => Some(namespace.as_str()),
                    WatchScope::Cluster => None,
                };
                match self.lister.list(&gvr, namespace) {
                    Ok(objects) => {
                        for obj in objects {
                            if label_selector_admits(&selector.label_selector, &obj.labels) {
                                live.insert(obj.identifier.clone(), obj);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "cluster listing failed, skipping this resource for reconcile"),
                }
            }
        }
        live
    }
}

impl reverser_worker::FolderReconciler for TargetReconciler {
    fn reconcile(&self, clone_dir: &Path, base_path: &str) -> Vec<ReconcileChange> {
        TargetReconciler::reconcile(self, clone_dir, base_path)
    }
}

fn label_selector_admits(selector: &Option<LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    selector.as_ref().is_none_or(|s| s.matches(labels))
}

/// Walk `<clone_dir>/<base_path>` and decode every `.yaml` file's path,
/// relative to `base_path`, into an identifier. A path that doesn't parse
/// is skipped with a warning and never produces a DELETE.
fn walk_disk(clone_dir: &Path, base_path: &str) -> HashMap<ObjectIdentifier, String> {
    let root = clone_dir.join(base_path.trim_start_matches('/'));
    let mut out = HashMap::new();
    if !root.is_dir() {
        return out;
    }
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            // Relative to clone_dir, not root: reverser_path::parse expects
            // the base path itself still present, so it can strip it at a
            // component boundary instead of us stripping it blind here.
            let Ok(relative) = path.strip_prefix(clone_dir) else { continue };
            let relative = relative.to_string_lossy().replace('\\', "/");
            match reverser_path::parse(&relative, base_path) {
                Ok(identifier) => {
                    out.insert(identifier, relative);
                }
                Err(e) => warn!(path = %relative, error = %e, "skipping unparsable file during reconcile"),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::{LabelSelector, ResourceSelector};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct FixedLister(Vec<ListedObject>);
    impl ClusterLister for FixedLister {
        fn list(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Result<Vec<ListedObject>, ListError> {
            Ok(self
                .0
                .iter()
                .filter(|o| o.identifier.gvr == *gvr && o.identifier.namespace.as_deref() == namespace)
                .map(|o| ListedObject {
                    identifier: o.identifier.clone(),
                    labels: o.labels.clone(),
                    object: o.object.clone(),
                })
                .collect())
        }
    }

    fn configmap_gvr() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "configmaps")
    }

    fn rule(target_id: &str) -> WatchRule {
        WatchRule {
            id: "r1".to_string(),
            target_id: target_id.to_string(),
            scope: WatchScope::Namespaced { namespace: "team".to_string() },
            selectors: vec![ResourceSelector {
                operations: vec![Operation::Create, Operation::Update, Operation::Delete],
                group: String::new(),
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
                label_selector: None,
            }],
        }
    }

    fn write_on_disk(clone_dir: &Path, base: &str, rel_path: &str) {
        let full = clone_dir.join(base).join(rel_path.trim_start_matches('/'));
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, "data:\n  foo: \"1\"\n").unwrap();
    }

    #[test]
    fn emits_delete_for_disk_only_identifier() {
        let td = tempdir().unwrap();
        write_on_disk(td.path(), "live", "core/v1/configmaps/team/cm-gone.yaml");

        let reconciler = TargetReconciler::new(Arc::new(FixedLister(vec![])), vec![rule("t1")]);
        let changes = reconciler.reconcile(td.path(), "live");

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Delete);
        assert_eq!(changes[0].identifier.name, "cm-gone");
    }

    #[test]
    fn emits_upsert_for_cluster_only_identifier() {
        let td = tempdir().unwrap();
        let identifier = ObjectIdentifier::namespaced(configmap_gvr(), "team", "cm-new");
        let listed = ListedObject {
            identifier: identifier.clone(),
            labels: BTreeMap::new(),
            object: StructuredDocument::new(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm-new", "namespace": "team", "resourceVersion": "123"},
                "data": {"foo": "1"}
            })),
        };

        let reconciler = TargetReconciler::new(Arc::new(FixedLister(vec![listed])), vec![rule("t1")]);
        let changes = reconciler.reconcile(td.path(), "live");

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Update);
        assert_eq!(changes[0].identifier, identifier);
        // Sanitized: resourceVersion must not survive into the emitted object.
        let object = changes[0].object.as_ref().unwrap();
        assert!(object.get_path(&["metadata", "resourceVersion"]).is_none());
    }

    #[test]
    fn present_in_both_is_skipped() {
        let td = tempdir().unwrap();
        write_on_disk(td.path(), "live", "core/v1/configmaps/team/cm-a.yaml");
        let identifier = ObjectIdentifier::namespaced(configmap_gvr(), "team", "cm-a");
        let listed = ListedObject {
            identifier: identifier.clone(),
            labels: BTreeMap::new(),
            object: StructuredDocument::new(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm-a", "namespace": "team"}
            })),
        };

        let reconciler = TargetReconciler::new(Arc::new(FixedLister(vec![listed])), vec![rule("t1")]);
        let changes = reconciler.reconcile(td.path(), "live");
        assert!(changes.is_empty());
    }

    #[test]
    fn sibling_base_path_is_never_confused_with_target_base() {
        let td = tempdir().unwrap();
        // A ConfigMap that lives outside the target's base path entirely;
        // the walk must never see it because it never descends there.
        write_on_disk(td.path(), "live2", "core/v1/configmaps/team/oeps3.yaml");

        let reconciler = TargetReconciler::new(Arc::new(FixedLister(vec![])), vec![rule("t1")]);
        let changes = reconciler.reconcile(td.path(), "live");
        assert!(changes.is_empty(), "a file under a sibling directory must not be reconciled as part of this base path");
    }

    #[test]
    fn label_selector_excludes_non_admitted_live_objects() {
        let td = tempdir().unwrap();
        let identifier = ObjectIdentifier::namespaced(configmap_gvr(), "team", "cm-excluded");
        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "someone-else".to_string());
        let listed = ListedObject {
            identifier,
            labels,
            object: StructuredDocument::new(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm-excluded", "namespace": "team"}
            })),
        };

        let mut r = rule("t1");
        r.selectors[0].label_selector = Some(LabelSelector {
            match_labels: BTreeMap::from([("managed-by".to_string(), "reverser".to_string())]),
            match_expressions: vec![],
        });

        let reconciler = TargetReconciler::new(Arc::new(FixedLister(vec![listed])), vec![r]);
        let changes = reconciler.reconcile(td.path(), "live");
        assert!(changes.is_empty(), "live object excluded by the rule's label selector must not be treated as missing from disk");
    }
}
