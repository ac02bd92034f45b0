//! [`ReconcilerFactory`] that builds a [`TargetReconciler`] from whatever
//! `WatchRule`s the Rule Store currently has bound to a Target: the Folder
//! Reconciler only reconciles resources a live rule would have admitted in
//! the first place.

use std::sync::Arc;

use reverser_controllers::ReconcilerFactory;
use reverser_reconciler::{ClusterLister, TargetReconciler};
use reverser_rules::RuleStore;
use reverser_types::Target;
use reverser_worker::FolderReconciler;

pub struct RuleBoundReconcilerFactory {
    rule_store: Arc<RuleStore>,
    lister: Arc<dyn ClusterLister>,
}

impl RuleBoundReconcilerFactory {
    pub fn new(rule_store: Arc<RuleStore>, lister: Arc<dyn ClusterLister>) -> Self {
        Self { rule_store, lister }
    }
}

impl ReconcilerFactory for RuleBoundReconcilerFactory {
    fn build(&self, target: &Target) -> Option<Arc<dyn FolderReconciler>> {
        let rules = self.rule_store.rules_for_target(&target.id);
        if rules.is_empty() {
            return None;
        }
        Some(Arc::new(TargetReconciler::new(self.lister.clone(), rules)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reverser_reconciler::{ListError, ListedObject};
    use reverser_types::{GroupVersionResource, Operation, ResourceSelector, WatchRule, WatchScope};

    struct EmptyLister;
    impl ClusterLister for EmptyLister {
        fn list(&self, _gvr: &GroupVersionResource, _namespace: Option<&str>) -> Result<Vec<ListedObject>, ListError> {
            Ok(Vec::new())
        }
    }

    fn target(id: &str) -> Target {
        Target { id: id.to_string(), provider: "p".to_string(), branch: "main".to_string(), base_path: "live".to_string(), encryption: None, created_at: Utc::now() }
    }

    #[test]
    fn no_bound_rules_means_no_reconciler() {
        let factory = RuleBoundReconcilerFactory::new(Arc::new(RuleStore::new()), Arc::new(EmptyLister));
        assert!(factory.build(&target("ns/t1")).is_none());
    }

    #[test]
    fn a_bound_rule_produces_a_reconciler() {
        let store = Arc::new(RuleStore::new());
        store.upsert_rule(WatchRule {
            id: "r1".to_string(),
            target_id: "ns/t1".to_string(),
            scope: WatchScope::Namespaced { namespace: "team".to_string() },
            selectors: vec![ResourceSelector {
                operations: vec![Operation::Create],
                group: String::new(),
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
                label_selector: None,
            }],
        });
        let factory = RuleBoundReconcilerFactory::new(store, Arc::new(EmptyLister));
        assert!(factory.build(&target("ns/t1")).is_some());
    }
}
