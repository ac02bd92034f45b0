//! Wires every crate in the workspace into one running system. Binding a
//! TCP listener to the `axum::Router` this module hands back, and choosing
//! when to call [`run_controllers`], is left to the embedding binary — the
//! same "command-line entry point is out of scope" boundary the Admission
//! Handler's own `server` module draws around itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;
use reverser_config::AppConfig;
use reverser_controllers::ControllerContext;
use reverser_reconciler::ClusterLister;
use reverser_router::{EventRouter, WorkerResources, WorkerSupervisor};
use reverser_rules::RuleStore;
use reverser_webhook::{AdmissionHandler, EventDispatcher};

use crate::cluster_lister::KubeClusterLister;
use crate::git_prober::GitRepositoryProber;
use crate::reconciler_factory::RuleBoundReconcilerFactory;

/// Deployment-specific knobs [`reverser_config::AppConfig`] doesn't carry:
/// a local disk path and a runtime handle make no sense in a TOML file.
pub struct AssemblyOptions {
    pub clone_root: std::path::PathBuf,
    pub default_branch: String,
    pub queue_capacity: usize,
    pub shutdown_grace_period: std::time::Duration,
    pub secret_resource: Option<reverser_types::GroupVersionResource>,
    pub encryptor: Option<Arc<dyn reverser_encrypt::SecretEncryptor>>,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            clone_root: std::path::PathBuf::from(".reverser/clones"),
            default_branch: "main".to_string(),
            queue_capacity: 256,
            shutdown_grace_period: std::time::Duration::from_secs(30),
            secret_resource: Some(reverser_types::GroupVersionResource::new("", "v1", "secrets")),
            encryptor: None,
        }
    }
}

/// Every long-lived component of one running process, handed back so the
/// embedder can drive the admission HTTP surface and the controller loops
/// however it sees fit.
pub struct Assembled {
    pub rule_store: Arc<RuleStore>,
    pub admission_handler: Arc<AdmissionHandler>,
    pub router: Arc<EventRouter>,
    pub controller_context: Arc<ControllerContext>,
}

/// Build the Rule Store, Admission Handler, Event Router (with its Worker
/// Supervisor), and the shared Target/Provider controller context — but
/// spawn nothing yet.
pub fn assemble(config: &AppConfig, options: AssemblyOptions, kube_client: Client, runtime: tokio::runtime::Handle) -> Assembled {
    let rule_store = Arc::new(RuleStore::new());

    let supervisor = Arc::new(WorkerSupervisor::new());
    let router = Arc::new(EventRouter::new(supervisor, config.dead_letter_log_path().to_path_buf()));

    let admission_handler = Arc::new(AdmissionHandler::new(rule_store.clone(), router.clone() as Arc<dyn EventDispatcher>));

    let lister: Arc<dyn ClusterLister> = Arc::new(KubeClusterLister::new(kube_client.clone(), runtime));
    let reconciler_factory = Arc::new(RuleBoundReconcilerFactory::new(rule_store.clone(), lister));

    let worker_resources = WorkerResources {
        clone_root: options.clone_root,
        default_branch: options.default_branch,
        push_policy: config.default_push_policy(),
        retry_policy: config.default_retry_policy().clone(),
        reconcile_interval: config.reconcile_interval(),
        encryptor: options.encryptor,
        secret_resource: options.secret_resource,
        queue_capacity: options.queue_capacity,
        shutdown_grace_period: options.shutdown_grace_period,
    };

    let controller_context = Arc::new(ControllerContext {
        client: kube_client,
        router: router.clone(),
        worker_resources,
        providers: Arc::new(Mutex::new(HashMap::new())),
        prober: Arc::new(GitRepositoryProber::default()),
        reconciler_factory,
    });

    Assembled { rule_store, admission_handler, router, controller_context }
}

/// The webhook server's HTTP surface, ready to mount and serve.
pub fn admission_router(assembled: &Assembled, path: &str) -> axum::Router {
    reverser_webhook::server::admission_router(path, assembled.admission_handler.clone())
}

/// Runs the Target/Provider reconciliation loops until the embedder drops
/// this future. Controllers are the last thing to stop.
pub async fn run_controllers(assembled: Assembled) {
    reverser_controllers::run(assembled.controller_context).await
}
