//! Target/Provider Controllers.
//!
//! Standard level-triggered reconciliation loops, one per CRD kind: watch
//! the declared configuration, validate it (allowed-branch glob match,
//! repository reachability), update `Ready`/`Conflict` conditions, and
//! register/unregister Targets with the [`reverser_router::EventRouter`].
//! No business logic beyond config validation and router bookkeeping lives
//! here — the Router and Branch Worker own everything downstream.
//!
//! The finalizer-guarded apply/cleanup split and the `Controller::run`
//! wiring follow `phgit_operator`'s `preview_controller`; the shared,
//! injectable reconciler context (providers cache, locks-by-key) follows
//! `octopilot-secret-manager-controller`'s `Reconciler` type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    Client, CustomResource, ResourceExt,
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        finalizer::{Event as FinalizerEvent, finalizer},
        watcher,
    },
};
use reverser_router::{EventRouter, WorkerResources};
use reverser_types::{Condition, ConditionStatus, CredentialsRef, Provider, PushPolicy, Target, TargetEncryption, TargetKey, normalize_repo_url};
use reverser_worker::FolderReconciler;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("finalizer error: {0}")]
    Finalizer(String),
    #[error("object has no namespace")]
    MissingNamespace,
}

/// Injected so this crate never depends on the Git transport directly; the
/// controller layer only needs a yes/no reachability answer to gate a
/// Provider's `Ready` condition.
pub trait RepositoryProber: Send + Sync {
    fn probe(&self, canonical_url: &str, credentials: &CredentialsRef) -> Result<(), String>;
}

/// Injected so this crate never depends on `reverser-reconciler`'s cluster
/// listing machinery; builds the per-Target Folder Reconciler a new
/// registration should hand to the worker, if the Target has any bound
/// `WatchRule`s yet.
pub trait ReconcilerFactory: Send + Sync {
    fn build(&self, target: &Target) -> Option<Arc<dyn FolderReconciler>>;
}

/// Shared state both controllers read and write. One instance is wired up
/// by the embedder (the out-of-scope CLI / controller-manager binary) and
/// handed to [`run`].
pub struct ControllerContext {
    pub client: Client,
    pub router: Arc<EventRouter>,
    pub worker_resources: WorkerResources,
    /// Providers validated `Ready` by the provider controller, keyed by
    /// CRD name; the target controller only registers Targets against a
    /// Provider present here.
    pub providers: Arc<Mutex<HashMap<String, Provider>>>,
    pub prober: Arc<dyn RepositoryProber>,
    pub reconciler_factory: Arc<dyn ReconcilerFactory>,
}

async fn patch_status<K>(api: &Api<K>, name: &str, conditions: Vec<Condition>) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + Serialize + for<'de> Deserialize<'de>,
    K::DynamicType: Default,
{
    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Provider custom resource: URL, secret ref, and push policy.
/// Cluster-scoped: Targets in any namespace reference it by name.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, CustomResource)]
#[kube(group = "gitops-reverser.io", version = "v1alpha1", kind = "GitProvider", status = "GitProviderStatus", shortname = "gprovider")]
#[serde(rename_all = "camelCase")]
pub struct GitProviderSpec {
    pub url: String,
    pub credentials: GitProviderCredentialsSpec,
    #[serde(default)]
    pub push_policy: Option<GitProviderPushPolicySpec>,
    #[serde(default)]
    pub allowed_branches: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GitProviderCredentialsSpec {
    Ssh { secret_name: String, private_key_key: String, known_hosts_key: String },
    HttpToken { secret_name: String, token_key: String },
}

impl From<GitProviderCredentialsSpec> for CredentialsRef {
    fn from(spec: GitProviderCredentialsSpec) -> Self {
        match spec {
            GitProviderCredentialsSpec::Ssh { secret_name, private_key_key, known_hosts_key } => {
                CredentialsRef::Ssh { secret_name, private_key_key, known_hosts_key }
            }
            GitProviderCredentialsSpec::HttpToken { secret_name, token_key } => CredentialsRef::HttpToken { secret_name, token_key },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitProviderPushPolicySpec {
    #[serde(default = "default_push_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_commits")]
    pub max_commits: u32,
}

fn default_push_interval_secs() -> u64 {
    60
}

fn default_max_commits() -> u32 {
    20
}

impl GitProviderSpec {
    fn to_provider(&self, name: &str) -> Provider {
        let push_policy = self
            .push_policy
            .as_ref()
            .map(|p| PushPolicy { interval: Duration::from_secs(p.interval_secs), max_commits: p.max_commits })
            .unwrap_or_default();
        Provider {
            name: name.to_string(),
            canonical_url: normalize_repo_url(&self.url),
            credentials: self.credentials.clone().into(),
            push_policy,
            allowed_branches: self.allowed_branches.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct GitProviderStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Target custom resource: providerRef, branch, base path, and an
/// optional encryption block.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, CustomResource)]
#[kube(
    group = "gitops-reverser.io",
    version = "v1alpha1",
    kind = "GitTarget",
    namespaced,
    status = "GitTargetStatus",
    shortname = "gtarget"
)]
#[serde(rename_all = "camelCase")]
pub struct GitTargetSpec {
    pub provider_ref: String,
    pub branch: String,
    pub base_path: String,
    #[serde(default)]
    pub encryption: Option<GitTargetEncryptionSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitTargetEncryptionSpec {
    pub enabled: bool,
    #[serde(default)]
    pub encryptor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct GitTargetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub mod provider_controller {
    use super::*;

    const FINALIZER: &str = "gitops-reverser.io/provider";

    pub async fn reconcile(provider: Arc<GitProvider>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let api: Api<GitProvider> = Api::all(ctx.client.clone());
        finalizer(&api, FINALIZER, provider, |event| async {
            match event {
                FinalizerEvent::Apply(p) => apply(p, ctx.clone()).await,
                FinalizerEvent::Cleanup(p) => cleanup(p, ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| ControllerError::Finalizer(e.to_string()))
    }

    async fn apply(provider: Arc<GitProvider>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let name = provider.name_any();
        let model = provider.spec.to_provider(&name);
        let now = Utc::now();

        let condition = match ctx.prober.probe(&model.canonical_url, &model.credentials) {
            Ok(()) => {
                ctx.providers.lock().unwrap().insert(name.clone(), model);
                Condition::ready(ConditionStatus::True, "Reachable", "repository is reachable", now)
            }
            Err(reason) => {
                ctx.providers.lock().unwrap().remove(&name);
                Condition::ready(ConditionStatus::False, "Unreachable", reason, now)
            }
        };

        let api: Api<GitProvider> = Api::all(ctx.client.clone());
        patch_status(&api, &name, vec![condition]).await?;

        Ok(Action::requeue(Duration::from_secs(300)))
    }

    async fn cleanup(provider: Arc<GitProvider>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let name = provider.name_any();
        ctx.providers.lock().unwrap().remove(&name);
        info!(provider = %name, "provider removed from cache");
        Ok(Action::await_change())
    }

    pub fn error_policy(_provider: Arc<GitProvider>, error: &ControllerError, _ctx: Arc<ControllerContext>) -> Action {
        warn!(error = %error, "provider reconciliation failed");
        Action::requeue(Duration::from_secs(15))
    }
}

pub mod target_controller {
    use super::*;

    const FINALIZER: &str = "gitops-reverser.io/target";

    pub async fn reconcile(target: Arc<GitTarget>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let ns = target.namespace().ok_or(ControllerError::MissingNamespace)?;
        let api: Api<GitTarget> = Api::namespaced(ctx.client.clone(), &ns);
        finalizer(&api, FINALIZER, target, |event| async {
            match event {
                FinalizerEvent::Apply(t) => apply(t, ctx.clone()).await,
                FinalizerEvent::Cleanup(t) => cleanup(t, ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| ControllerError::Finalizer(e.to_string()))
    }

    async fn apply(target: Arc<GitTarget>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let ns = target.namespace().ok_or(ControllerError::MissingNamespace)?;
        let name = target.name_any();
        let now = Utc::now();
        let api: Api<GitTarget> = Api::namespaced(ctx.client.clone(), &ns);

        let provider = ctx.providers.lock().unwrap().get(&target.spec.provider_ref).cloned();
        let Some(provider) = provider else {
            let condition = Condition::ready(
                ConditionStatus::False,
                "ProviderNotFound",
                format!("provider {:?} not found or not ready", target.spec.provider_ref),
                now,
            );
            patch_status(&api, &name, vec![condition]).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        };

        if !provider.allows_branch(&target.spec.branch) {
            let condition = Condition::ready(
                ConditionStatus::False,
                "BranchNotAllowed",
                format!("branch {:?} is not allowed by provider {:?}", target.spec.branch, provider.name),
                now,
            );
            patch_status(&api, &name, vec![condition]).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }

        let model = Target {
            id: format!("{ns}/{name}"),
            provider: provider.name.clone(),
            branch: target.spec.branch.clone(),
            base_path: target.spec.base_path.clone(),
            encryption: target
                .spec
                .encryption
                .as_ref()
                .map(|e| TargetEncryption { enabled: e.enabled, encryptor: e.encryptor.clone() }),
            created_at: now,
        };
        let target_key = TargetKey::new(provider.canonical_url.clone(), model.branch.clone(), model.base_path.clone());
        let reconciler = ctx.reconciler_factory.build(&model);

        let condition = match ctx.router.register_target(&model.id, target_key, reconciler, &ctx.worker_resources).await {
            Ok(()) => Condition::ready(ConditionStatus::True, "Registered", "target registered with the event router", now),
            Err(reverser_types::ReverserError::DuplicateTarget(_)) => {
                Condition::conflict("another target already claims this (repository, branch, base path)", now)
            }
            Err(e) => Condition::ready(ConditionStatus::False, "RegistrationFailed", e.to_string(), now),
        };

        patch_status(&api, &name, vec![condition]).await?;
        Ok(Action::requeue(Duration::from_secs(300)))
    }

    async fn cleanup(target: Arc<GitTarget>, ctx: Arc<ControllerContext>) -> Result<Action, ControllerError> {
        let ns = target.namespace().ok_or(ControllerError::MissingNamespace)?;
        let name = target.name_any();
        let id = format!("{ns}/{name}");
        ctx.router.unregister_target(&id, &ctx.worker_resources).await;
        info!(target = %id, "target unregistered from the event router");
        Ok(Action::await_change())
    }

    pub fn error_policy(_target: Arc<GitTarget>, error: &ControllerError, _ctx: Arc<ControllerContext>) -> Action {
        warn!(error = %error, "target reconciliation failed");
        Action::requeue(Duration::from_secs(15))
    }
}

/// Runs both controllers concurrently until either stream ends — normally
/// only on shutdown of the surrounding process, after everything else has
/// already stopped.
pub async fn run(ctx: Arc<ControllerContext>) {
    let providers_api: Api<GitProvider> = Api::all(ctx.client.clone());
    let targets_api: Api<GitTarget> = Api::all(ctx.client.clone());

    let providers = {
        let ctx = ctx.clone();
        Controller::new(providers_api, watcher::Config::default())
            .run(provider_controller::reconcile, provider_controller::error_policy, ctx)
            .for_each(|result| async move {
                if let Err(e) = result {
                    warn!(error = %e, "provider controller stream error");
                }
            })
    };

    let targets = {
        let ctx = ctx.clone();
        Controller::new(targets_api, watcher::Config::default())
            .run(target_controller::reconcile, target_controller::error_policy, ctx)
            .for_each(|result| async move {
                if let Err(e) = result {
                    warn!(error = %e, "target controller stream error");
                }
            })
    };

    tokio::join!(providers, targets);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_spec_normalizes_url_and_defaults_push_policy() {
        let spec = GitProviderSpec {
            url: "HTTPS://Example.com/Org/Repo.git/".to_string(),
            credentials: GitProviderCredentialsSpec::HttpToken { secret_name: "s".to_string(), token_key: "token".to_string() },
            push_policy: None,
            allowed_branches: vec![],
        };
        let provider = spec.to_provider("my-provider");
        assert_eq!(provider.canonical_url, "https://example.com/org/repo");
        assert_eq!(provider.push_policy, PushPolicy::default());
        assert!(provider.allows_branch("anything"));
    }

    #[test]
    fn provider_spec_carries_custom_push_policy() {
        let spec = GitProviderSpec {
            url: "https://example.com/org/repo".to_string(),
            credentials: GitProviderCredentialsSpec::Ssh {
                secret_name: "s".to_string(),
                private_key_key: "id_rsa".to_string(),
                known_hosts_key: "known_hosts".to_string(),
            },
            push_policy: Some(GitProviderPushPolicySpec { interval_secs: 30, max_commits: 5 }),
            allowed_branches: vec!["main".to_string(), "release/*".to_string()],
        };
        let provider = spec.to_provider("ssh-provider");
        assert_eq!(provider.push_policy.interval, Duration::from_secs(30));
        assert_eq!(provider.push_policy.max_commits, 5);
        assert!(provider.allows_branch("release/1.2"));
        assert!(!provider.allows_branch("feature/x"));
    }

    struct AlwaysReachable;
    impl RepositoryProber for AlwaysReachable {
        fn probe(&self, _canonical_url: &str, _credentials: &CredentialsRef) -> Result<(), String> {
            Ok(())
        }
    }

    struct NeverReachable;
    impl RepositoryProber for NeverReachable {
        fn probe(&self, _canonical_url: &str, _credentials: &CredentialsRef) -> Result<(), String> {
            Err("connection refused".to_string())
        }
    }

    #[test]
    fn repository_prober_is_object_safe_and_dispatches() {
        let provers: Vec<Arc<dyn RepositoryProber>> = vec![Arc::new(AlwaysReachable), Arc::new(NeverReachable)];
        let credentials = CredentialsRef::HttpToken { secret_name: "s".to_string(), token_key: "t".to_string() };
        assert!(provers[0].probe("https://example.com/org/repo", &credentials).is_ok());
        assert!(provers[1].probe("https://example.com/org/repo", &credentials).is_err());
    }

    struct NoReconcilers;
    impl ReconcilerFactory for NoReconcilers {
        fn build(&self, _target: &Target) -> Option<Arc<dyn FolderReconciler>> {
            None
        }
    }

    #[test]
    fn reconciler_factory_is_object_safe() {
        let factory: Arc<dyn ReconcilerFactory> = Arc::new(NoReconcilers);
        let target = Target {
            id: "ns/t1".to_string(),
            provider: "p".to_string(),
            branch: "main".to_string(),
            base_path: "live".to_string(),
            encryption: None,
            created_at: Utc::now(),
        };
        assert!(factory.build(&target).is_none());
    }
}
