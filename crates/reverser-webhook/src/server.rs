//! The axum HTTP surface for the Admission Handler. Binding a listener and
//! serving this router is the assembled binary's job (outside this
//! workspace's scope per the "command-line entry point" non-goal); this
//! module only builds the `axum::Router`.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use tracing::{info, warn};

use crate::{AdmissionHandler, AdmissionReview};

#[derive(Clone)]
struct AdmissionState {
    handler: Arc<AdmissionHandler>,
}

/// Build the admission webhook router. `path` is operator-defined (spec
/// §6): mount it wherever the `ValidatingWebhookConfiguration` points.
pub fn admission_router(path: &str, handler: Arc<AdmissionHandler>) -> Router {
    Router::new().route(path, post(handle_admission)).with_state(AdmissionState { handler })
}

async fn handle_admission(
    State(state): State<AdmissionState>,
    Json(review): Json<AdmissionReview>,
) -> (StatusCode, Json<AdmissionReview>) {
    let response = state.handler.review(review);

    let (decode_failures, dispatched) = state.handler.counters().snapshot();
    if decode_failures > 0 {
        warn!(decode_failures, dispatched, "admission review completed with a decode failure");
    } else {
        info!(dispatched, "admission review completed");
    }

    // Failure policy is "ignore": the HTTP status is always 200 with
    // `allowed: true` inside the body, never a 4xx/5xx that would make
    // the API server apply its failurePolicy.
    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdmissionOperation, AdmissionRequest, AdmissionResource, AdmissionUserInfo, EventDispatcher};
    use reverser_rules::RuleStore;
    use reverser_types::CapturedEvent;

    struct NullDispatcher;
    impl EventDispatcher for NullDispatcher {
        fn dispatch(&self, _event: CapturedEvent) {}
    }

    #[tokio::test]
    async fn handle_admission_always_returns_200_allowed() {
        let handler = Arc::new(AdmissionHandler::new(Arc::new(RuleStore::new()), Arc::new(NullDispatcher)));
        let state = AdmissionState { handler };

        let review = AdmissionReview {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            request: Some(AdmissionRequest {
                uid: "req-1".to_string(),
                operation: AdmissionOperation::Create,
                resource: AdmissionResource { group: String::new(), version: "v1".into(), resource: "configmaps".into() },
                namespace: Some("team".to_string()),
                name: Some("cm-a".to_string()),
                object: None,
                old_object: None,
                user_info: AdmissionUserInfo { username: "alice".to_string(), groups: vec![] },
            }),
            response: None,
        };

        let (status, Json(body)) = handle_admission(State(state), Json(review)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.response.unwrap().allowed);
    }
}
