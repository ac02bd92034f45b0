//! The Rule Store: `UpsertRule`, `DeleteRule`, and
//! `Match(object, plural) -> []RuleBinding`.
//!
//! The Admission Handler calls `match_event` on every incoming request, so
//! the read path must never block behind a Target/Provider controller's
//! `upsert_rule`/`delete_rule` call. This crate gets there with a
//! copy-on-write snapshot: every mutation builds a brand new index and
//! swaps it in under a short-lived write lock; every read clones the
//! `Arc` under a short-lived read lock and then does all its work against
//! an immutable snapshot, so matching never contends with mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use reverser_types::{FlatRuleKey, GroupVersionResource, Operation, RuleBinding, WatchRule, WatchScope};

#[derive(Debug, Clone)]
struct FlatEntry {
    rule_id: String,
    target_id: String,
    scope: WatchScope,
    label_selector: Option<reverser_types::LabelSelector>,
}

#[derive(Default)]
struct RuleIndex {
    rules: BTreeMap<String, WatchRule>,
    flat: HashMap<FlatRuleKey, Vec<FlatEntry>>,
}

impl RuleIndex {
    fn rebuild_from(rules: BTreeMap<String, WatchRule>) -> Self {
        let mut flat: HashMap<FlatRuleKey, Vec<FlatEntry>> = HashMap::new();
        for rule in rules.values() {
            for selector in &rule.selectors {
                let gvr = GroupVersionResource::new(&selector.group, &selector.version, &selector.resource);
                for operation in &selector.operations {
                    let key = FlatRuleKey { operation: *operation, gvr: gvr.clone() };
                    flat.entry(key).or_default().push(FlatEntry {
                        rule_id: rule.id.clone(),
                        target_id: rule.target_id.clone(),
                        scope: rule.scope.clone(),
                        label_selector: selector.label_selector.clone(),
                    });
                }
            }
        }
        Self { rules, flat }
    }
}

/// Lock-free-read index of [`WatchRule`]s, keyed for O(1) lookup by
/// (operation, group, version, resource).
pub struct RuleStore {
    index: RwLock<Arc<RuleIndex>>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self { index: RwLock::new(Arc::new(RuleIndex::default())) }
    }

    /// Insert or replace a rule by id, then rebuild and swap the
    /// derived index.
    pub fn upsert_rule(&self, rule: WatchRule) {
        let mut write = self.index.write().expect("rule store lock poisoned");
        let mut rules = write.rules.clone();
        rules.insert(rule.id.clone(), rule);
        *write = Arc::new(RuleIndex::rebuild_from(rules));
    }

    /// Remove a rule by id, if present.
    pub fn delete_rule(&self, rule_id: &str) {
        let mut write = self.index.write().expect("rule store lock poisoned");
        let mut rules = write.rules.clone();
        if rules.remove(rule_id).is_some() {
            *write = Arc::new(RuleIndex::rebuild_from(rules));
        }
    }

    /// Remove every rule bound to a given target, used when a Target is
    /// deleted.
    pub fn delete_rules_for_target(&self, target_id: &str) {
        let mut write = self.index.write().expect("rule store lock poisoned");
        let mut rules = write.rules.clone();
        let before = rules.len();
        rules.retain(|_, r| r.target_id != target_id);
        if rules.len() != before {
            *write = Arc::new(RuleIndex::rebuild_from(rules));
        }
    }

    pub fn rule_count(&self) -> usize {
        self.index.read().expect("rule store lock poisoned").rules.len()
    }

    /// Every rule currently bound to a Target, in id order. Used when
    /// (re)building that Target's Folder Reconciler.
    pub fn rules_for_target(&self, target_id: &str) -> Vec<WatchRule> {
        self.index
            .read()
            .expect("rule store lock poisoned")
            .rules
            .values()
            .filter(|r| r.target_id == target_id)
            .cloned()
            .collect()
    }

    /// Match an admitted event against the rule index. `namespace` is
    /// `None` for cluster-scoped objects. Matches on operation, GVR,
    /// namespace scope, and per-selector label selector, in that order —
    /// a miss on any narrows out the candidate rule.
    pub fn match_event(
        &self,
        operation: Operation,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Vec<RuleBinding> {
        let snapshot = self.index.read().expect("rule store lock poisoned").clone();
        let key = FlatRuleKey { operation, gvr: gvr.clone() };
        let Some(entries) = snapshot.flat.get(&key) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter(|entry| scope_matches(&entry.scope, namespace))
            .filter(|entry| entry.label_selector.as_ref().is_none_or(|sel| sel.matches(labels)))
            .map(|entry| RuleBinding { rule_id: entry.rule_id.clone(), target_id: entry.target_id.clone() })
            .collect()
    }
}

fn scope_matches(scope: &WatchScope, namespace: Option<&str>) -> bool {
    match scope {
        WatchScope::Cluster => true,
        WatchScope::Namespaced { namespace: rule_ns } => namespace == Some(rule_ns.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::{LabelSelector, LabelSelectorRequirement, ResourceSelector};

    fn configmap_rule(id: &str, target_id: &str, namespace: &str) -> WatchRule {
        WatchRule {
            id: id.to_string(),
            target_id: target_id.to_string(),
            scope: WatchScope::Namespaced { namespace: namespace.to_string() },
            selectors: vec![ResourceSelector {
                operations: vec![Operation::Create, Operation::Update],
                group: String::new(),
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
                label_selector: None,
            }],
        }
    }

    #[test]
    fn matches_on_operation_gvr_and_namespace() {
        let store = RuleStore::new();
        store.upsert_rule(configmap_rule("r1", "t1", "team-a"));

        let gvr = GroupVersionResource::new("", "v1", "configmaps");
        let hits = store.match_event(Operation::Create, &gvr, Some("team-a"), &BTreeMap::new());
        assert_eq!(hits, vec![RuleBinding { rule_id: "r1".into(), target_id: "t1".into() }]);

        assert!(store.match_event(Operation::Create, &gvr, Some("team-b"), &BTreeMap::new()).is_empty());
        assert!(store.match_event(Operation::Delete, &gvr, Some("team-a"), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn cluster_scoped_rule_matches_any_namespace() {
        let store = RuleStore::new();
        let rule = WatchRule {
            id: "r1".into(),
            target_id: "t1".into(),
            scope: WatchScope::Cluster,
            selectors: vec![ResourceSelector {
                operations: vec![Operation::Delete],
                group: "apps".into(),
                version: "v1".into(),
                resource: "deployments".into(),
                label_selector: None,
            }],
        };
        store.upsert_rule(rule);

        let gvr = GroupVersionResource::new("apps", "v1", "deployments");
        assert_eq!(store.match_event(Operation::Delete, &gvr, Some("anything"), &BTreeMap::new()).len(), 1);
        assert_eq!(store.match_event(Operation::Delete, &gvr, None, &BTreeMap::new()).len(), 1);
    }

    #[test]
    fn label_selector_narrows_match() {
        let store = RuleStore::new();
        let rule = WatchRule {
            id: "r1".into(),
            target_id: "t1".into(),
            scope: WatchScope::Cluster,
            selectors: vec![ResourceSelector {
                operations: vec![Operation::Update],
                group: String::new(),
                version: "v1".into(),
                resource: "secrets".into(),
                label_selector: Some(LabelSelector {
                    match_labels: BTreeMap::new(),
                    match_expressions: vec![LabelSelectorRequirement::Exists { key: "reverser.io/track".into() }],
                }),
            }],
        };
        store.upsert_rule(rule);

        let gvr = GroupVersionResource::new("", "v1", "secrets");
        let tracked = BTreeMap::from([("reverser.io/track".to_string(), "true".to_string())]);
        assert_eq!(store.match_event(Operation::Update, &gvr, None, &tracked).len(), 1);
        assert!(store.match_event(Operation::Update, &gvr, None, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn delete_rule_removes_matches() {
        let store = RuleStore::new();
        store.upsert_rule(configmap_rule("r1", "t1", "team-a"));
        assert_eq!(store.rule_count(), 1);
        store.delete_rule("r1");
        assert_eq!(store.rule_count(), 0);

        let gvr = GroupVersionResource::new("", "v1", "configmaps");
        assert!(store.match_event(Operation::Create, &gvr, Some("team-a"), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn upsert_replaces_existing_rule_by_id() {
        let store = RuleStore::new();
        store.upsert_rule(configmap_rule("r1", "t1", "team-a"));
        store.upsert_rule(configmap_rule("r1", "t2", "team-a"));
        assert_eq!(store.rule_count(), 1);

        let gvr = GroupVersionResource::new("", "v1", "configmaps");
        let hits = store.match_event(Operation::Create, &gvr, Some("team-a"), &BTreeMap::new());
        assert_eq!(hits, vec![RuleBinding { rule_id: "r1".into(), target_id: "t2".into() }]);
    }

    #[test]
    fn rules_for_target_returns_only_its_own_rules() {
        let store = RuleStore::new();
        store.upsert_rule(configmap_rule("r1", "t1", "team-a"));
        store.upsert_rule(configmap_rule("r2", "t2", "team-b"));
        let rules = store.rules_for_target("t1");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r1");
    }

    #[test]
    fn delete_rules_for_target_clears_all_its_rules() {
        let store = RuleStore::new();
        store.upsert_rule(configmap_rule("r1", "t1", "team-a"));
        store.upsert_rule(configmap_rule("r2", "t1", "team-b"));
        store.upsert_rule(configmap_rule("r3", "t2", "team-c"));
        store.delete_rules_for_target("t1");
        assert_eq!(store.rule_count(), 1);
    }
}
