//! Admission Handler.
//!
//! Synchronous entry point for the admission webhook: decodes a Kubernetes
//! `AdmissionReview`, consults the Rule Store, sanitizes each match, and
//! hands a [`reverser_types::CapturedEvent`] to an injected dispatcher —
//! the Event Router, in the assembled binary. The handler never blocks the
//! API call: failure policy is "ignore", so it always returns
//! `allowed: true`, even when decoding the object failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use reverser_rules::RuleStore;
use reverser_sanitizer::sanitize;
use reverser_types::{CapturedEvent, GroupVersionResource, ObjectIdentifier, Operation, StructuredDocument, UserInfo};
use serde::{Deserialize, Serialize};

pub mod server;

/// Receives every Captured Event the Admission Handler produces. The
/// Event Router implements this; kept as a trait here so this crate never
/// depends on the Router's worker-lifecycle machinery.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: CapturedEvent);
}

/// An `AdmissionReview` envelope, matching the `admission.k8s.io/v1` wire
/// shape. Only the fields this pipeline actually reads are modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn default_api_version() -> String {
    "admission.k8s.io/v1".to_string()
}

fn default_kind() -> String {
    "AdmissionReview".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: AdmissionOperation,
    pub resource: AdmissionResource,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub object: Option<serde_json::Value>,
    #[serde(default, rename = "oldObject")]
    pub old_object: Option<serde_json::Value>,
    #[serde(rename = "userInfo")]
    pub user_info: AdmissionUserInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdmissionOperation {
    Create,
    Update,
    Delete,
    Connect,
}

impl AdmissionOperation {
    fn as_operation(self) -> Option<Operation> {
        match self {
            AdmissionOperation::Create => Some(Operation::Create),
            AdmissionOperation::Update => Some(Operation::Update),
            AdmissionOperation::Delete => Some(Operation::Delete),
            AdmissionOperation::Connect => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionUserInfo {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

/// Running counters the Admission Handler maintains. Side effects are
/// limited to enqueuing and incrementing counters.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    pub decode_failures: AtomicU64,
    pub dispatched: AtomicU64,
}

impl AdmissionCounters {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.decode_failures.load(Ordering::Relaxed), self.dispatched.load(Ordering::Relaxed))
    }
}

pub struct AdmissionHandler {
    rule_store: Arc<RuleStore>,
    dispatcher: Arc<dyn EventDispatcher>,
    counters: AdmissionCounters,
}

impl AdmissionHandler {
    pub fn new(rule_store: Arc<RuleStore>, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self { rule_store, dispatcher, counters: AdmissionCounters::default() }
    }

    pub fn counters(&self) -> &AdmissionCounters {
        &self.counters
    }

    /// Process one `AdmissionReview`, always returning an `allowed: true`
    /// response (advisory warnings aside).
    pub fn review(&self, review: AdmissionReview) -> AdmissionReview {
        let Some(request) = review.request else {
            return admit(String::new(), None);
        };

        let Some(operation) = request.operation.as_operation() else {
            // CONNECT requests (exec/attach/portforward subresources) carry
            // no object payload this pipeline cares about.
            return admit(request.uid, None);
        };

        let raw_object = match operation {
            Operation::Delete => request.old_object.as_ref(),
            _ => request.object.as_ref(),
        };

        let Some(doc) = raw_object.map(|v| StructuredDocument::new(v.clone())) else {
            // Both object and old-object empty: synthesize a minimal
            // identifier from the request envelope itself, if we have
            // enough to build one; otherwise this is a decode failure.
            let Some(name) = request.name.clone() else {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                return admit(request.uid, Some(vec!["gitops-reverser: could not decode object".to_string()]));
            };
            let gvr = GroupVersionResource::new(request.resource.group.clone(), request.resource.version.clone(), request.resource.resource.clone());
            let identifier = match &request.namespace {
                Some(ns) => ObjectIdentifier::namespaced(gvr.clone(), ns.clone(), name.clone()),
                None => ObjectIdentifier::cluster_scoped(gvr.clone(), name.clone()),
            };
            self.dispatch_matches(operation, &gvr, request.namespace.as_deref(), &Default::default(), identifier, None, &request.user_info);
            return admit(request.uid, None);
        };

        let gvr = GroupVersionResource::new(request.resource.group.clone(), request.resource.version.clone(), request.resource.resource.clone());
        let namespace = doc.namespace().map(str::to_string).or_else(|| request.namespace.clone());
        let name = doc.name().map(str::to_string).or(request.name.clone());

        let Some(name) = name else {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            return admit(request.uid, Some(vec!["gitops-reverser: object has no name".to_string()]));
        };

        let labels = doc.labels();
        let identifier = match &namespace {
            Some(ns) => ObjectIdentifier::namespaced(gvr.clone(), ns.clone(), name),
            None => ObjectIdentifier::cluster_scoped(gvr.clone(), name),
        };

        let object_for_event = if operation == Operation::Delete { None } else { Some(doc) };
        self.dispatch_matches(operation, &gvr, namespace.as_deref(), &labels, identifier, object_for_event, &request.user_info);

        admit(request.uid, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_matches(
        &self,
        operation: Operation,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        labels: &std::collections::BTreeMap<String, String>,
        identifier: ObjectIdentifier,
        object: Option<StructuredDocument>,
        user_info: &AdmissionUserInfo,
    ) {
        let bindings = self.rule_store.match_event(operation, gvr, namespace, labels);
        // Common kube-system/lease traffic produces no binding; return
        // without logging.
        if bindings.is_empty() {
            return;
        }

        let sanitized = object.as_ref().map(sanitize);
        let user = UserInfo { username: user_info.username.clone(), groups: user_info.groups.clone() };
        let now = Utc::now();

        for binding in bindings {
            let event = CapturedEvent {
                operation,
                identifier: identifier.clone(),
                object: sanitized.clone(),
                user: user.clone(),
                target_id: binding.target_id,
                admitted_at: now,
            };
            self.dispatcher.dispatch(event);
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn admit(uid: String, warnings: Option<Vec<String>>) -> AdmissionReview {
    AdmissionReview {
        api_version: default_api_version(),
        kind: default_kind(),
        request: None,
        response: Some(AdmissionResponse { uid, allowed: true, warnings }),
    }
}
