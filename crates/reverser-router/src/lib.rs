//! Event Router.
//!
//! Sits between the Admission Handler / Rule Store and the Branch Workers:
//! every admitted, rule-matched event arrives here keyed by `target_id`, and
//! this crate is the only thing that knows which running worker (if any)
//! owns that Target. Two mappings are kept: a coarse
//! `(repo-url-normalized, branch) -> worker` registry, since several Targets
//! can legitimately share one clone and one worker, and a finer
//! `target_id -> (repo-url-normalized, branch, base-path)` mapping, which is
//! what makes the per-Target uniqueness check possible.
//!
//! The worker registry itself is owned exclusively by [`WorkerSupervisor`] —
//! nothing outside this module ever holds a `WorkerHandle` directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reverser_encrypt::SecretEncryptor;
use reverser_events::{RouteMissLog, RouteMissRecord};
use reverser_retry::RetryStrategyConfig;
use reverser_types::{CapturedEvent, GroupVersionResource, PushPolicy, ReverserError, TargetKey};
use reverser_webhook::EventDispatcher;
use reverser_worker::{BranchWorkerConfig, FolderReconciler, WorkerHandle};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Identifies the Branch Worker owning a (repository, branch) pair. Coarser
/// than [`TargetKey`]: several Targets can share one `RepoBranchKey` as long
/// as each still resolves to its own base path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoBranchKey {
    pub normalized_repo_url: String,
    pub branch: String,
}

impl RepoBranchKey {
    pub fn new(normalized_repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self { normalized_repo_url: normalized_repo_url.into(), branch: branch.into() }
    }
}

/// Resources every worker under one [`RepoBranchKey`] needs beyond its
/// per-Target routing info, supplied once by whatever assembles the router
/// (normally `reverser-core`, fed by the Provider/Target controllers).
pub struct WorkerResources {
    pub clone_root: PathBuf,
    pub default_branch: String,
    pub push_policy: PushPolicy,
    pub retry_policy: RetryStrategyConfig,
    pub reconcile_interval: Duration,
    pub encryptor: Option<Arc<dyn SecretEncryptor>>,
    pub secret_resource: Option<GroupVersionResource>,
    pub queue_capacity: usize,
    pub shutdown_grace_period: Duration,
}

/// Outcome of handing one event to the supervisor.
enum DispatchOutcome {
    Delivered,
    QueueFull,
    RouteMiss,
}

struct RunningWorker {
    handle: WorkerHandle,
    join: JoinHandle<()>,
    /// (target_id, base_path) pairs currently served, parallel to
    /// `BranchWorkerConfig::target_ids`/`base_paths`.
    targets: Vec<(String, String)>,
    reconcilers: HashMap<String, Arc<dyn FolderReconciler>>,
}

/// Owns the only registry of running Branch Worker tasks. A
/// `BranchWorkerConfig` is captured by value when a worker is spawned and
/// can't be mutated afterward, so adding or removing a Target from a worker
/// that already exists means gracefully stopping it and respawning with the
/// complete updated target set — this keeps the registry key coarser than
/// the Target key without giving up per-Target updates.
pub struct WorkerSupervisor {
    workers: Mutex<HashMap<RepoBranchKey, RunningWorker>>,
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        Self { workers: Mutex::new(HashMap::new()) }
    }
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn dispatch(&self, key: &RepoBranchKey, event: CapturedEvent) -> DispatchOutcome {
        let workers = self.workers.lock().unwrap();
        match workers.get(key) {
            Some(running) => match running.handle.try_send_event(event) {
                Ok(()) => DispatchOutcome::Delivered,
                Err(_) => DispatchOutcome::QueueFull,
            },
            None => DispatchOutcome::RouteMiss,
        }
    }

    pub async fn status(&self, key: &RepoBranchKey) -> Option<reverser_worker::WorkerStatusSnapshot> {
        let handle = self.workers.lock().unwrap().get(key).map(|w| w.handle.clone());
        match handle {
            Some(h) => Some(h.status().await),
            None => None,
        }
    }

    fn current_targets(&self, key: &RepoBranchKey) -> Vec<(String, String)> {
        self.workers.lock().unwrap().get(key).map(|w| w.targets.clone()).unwrap_or_default()
    }

    fn current_reconcilers(&self, key: &RepoBranchKey) -> HashMap<String, Arc<dyn FolderReconciler>> {
        self.workers.lock().unwrap().get(key).map(|w| w.reconcilers.clone()).unwrap_or_default()
    }

    /// Attach a Target to this (repo, branch)'s worker, spawning one lazily
    /// if none exists yet, or respawning with the full updated target set
    /// if this key already has a running worker.
    pub async fn register_target(
        &self,
        key: RepoBranchKey,
        target_id: &str,
        base_path: &str,
        reconciler: Option<Arc<dyn FolderReconciler>>,
        resources: &WorkerResources,
    ) {
        let mut targets = self.current_targets(&key);
        if let Some(existing) = targets.iter_mut().find(|(t, _)| t == target_id) {
            if existing.1 == base_path && reconciler.is_none() {
                return; // already registered with this exact base path, nothing to change
            }
            existing.1 = base_path.to_string();
        } else {
            targets.push((target_id.to_string(), base_path.to_string()));
        }

        let mut reconcilers = self.current_reconcilers(&key);
        if let Some(r) = reconciler {
            reconcilers.insert(target_id.to_string(), r);
        }

        self.respawn(key, targets, reconcilers, resources).await;
    }

    /// Detach a Target from its worker, stopping the worker entirely once
    /// no Target references it anymore.
    pub async fn unregister_target(&self, key: RepoBranchKey, target_id: &str, resources: &WorkerResources) {
        let mut targets = self.current_targets(&key);
        targets.retain(|(t, _)| t != target_id);

        if targets.is_empty() {
            let removed = self.workers.lock().unwrap().remove(&key);
            if let Some(running) = removed {
                running.handle.shutdown(resources.shutdown_grace_period).await;
                let _ = running.join.await;
                info!(repo_url = %key.normalized_repo_url, branch = %key.branch, "branch worker stopped, no targets remain");
            }
            return;
        }

        let mut reconcilers = self.current_reconcilers(&key);
        reconcilers.remove(target_id);
        self.respawn(key, targets, reconcilers, resources).await;
    }

    async fn respawn(
        &self,
        key: RepoBranchKey,
        targets: Vec<(String, String)>,
        reconcilers: HashMap<String, Arc<dyn FolderReconciler>>,
        resources: &WorkerResources,
    ) {
        let old = self.workers.lock().unwrap().remove(&key);
        if let Some(running) = old {
            running.handle.shutdown(resources.shutdown_grace_period).await;
            let _ = running.join.await;
        }

        let config = BranchWorkerConfig {
            target_ids: targets.iter().map(|(t, _)| t.clone()).collect(),
            repo_url: key.normalized_repo_url.clone(),
            branch: key.branch.clone(),
            default_branch: resources.default_branch.clone(),
            clone_dir: resources.clone_root.join(worker_dir_name(&key)),
            base_paths: targets.iter().map(|(_, b)| b.clone()).collect(),
            push_policy: resources.push_policy,
            retry_policy: resources.retry_policy.clone(),
            reconcile_interval: resources.reconcile_interval,
            encryptor: resources.encryptor.clone(),
            secret_resource: resources.secret_resource.clone(),
            reconcilers: reconcilers.clone(),
            queue_capacity: resources.queue_capacity,
        };
        let (handle, join) = reverser_worker::spawn(config);
        info!(repo_url = %key.normalized_repo_url, branch = %key.branch, target_count = targets.len(), "branch worker (re)spawned");
        self.workers.lock().unwrap().insert(key, RunningWorker { handle, join, targets, reconcilers });
    }
}

fn worker_dir_name(key: &RepoBranchKey) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Routes admitted events to the worker owning their Target, and keeps the
/// finer `target_id -> RepoBranchKey` mapping used for per-Target
/// registration, duplicate detection, and route-miss bookkeeping.
pub struct EventRouter {
    supervisor: Arc<WorkerSupervisor>,
    /// `target_id -> RepoBranchKey`.
    routes: Mutex<HashMap<String, RepoBranchKey>>,
    /// Every registered Target's uniqueness key, so a second Target with
    /// the same (repo, branch, base path) is rejected up front instead of
    /// silently sharing the first Target's files.
    target_keys: Mutex<HashMap<String, TargetKey>>,
    route_misses: AtomicU64,
    queue_full_drops: AtomicU64,
    dead_letter: Mutex<RouteMissLog>,
    dead_letter_path: PathBuf,
}

impl EventRouter {
    pub fn new(supervisor: Arc<WorkerSupervisor>, dead_letter_path: PathBuf) -> Self {
        Self {
            supervisor,
            routes: Mutex::new(HashMap::new()),
            target_keys: Mutex::new(HashMap::new()),
            route_misses: AtomicU64::new(0),
            queue_full_drops: AtomicU64::new(0),
            dead_letter: Mutex::new(RouteMissLog::new()),
            dead_letter_path,
        }
    }

    /// Route misses counted so far, and events dropped because their
    /// worker's input queue was full.
    pub fn counters(&self) -> (u64, u64) {
        (self.route_misses.load(Ordering::Relaxed), self.queue_full_drops.load(Ordering::Relaxed))
    }

    /// Register a Target's routing, rejecting it if another live Target
    /// already claims the same `(repo, branch, base_path)`: the second
    /// Target must report `Ready=False, Reason=Conflict` and must never
    /// cause duplicate commits.
    pub async fn register_target(
        &self,
        target_id: &str,
        target_key: TargetKey,
        reconciler: Option<Arc<dyn FolderReconciler>>,
        resources: &WorkerResources,
    ) -> Result<(), ReverserError> {
        {
            let mut keys = self.target_keys.lock().unwrap();
            if let Some(existing_target) = keys.iter().find_map(|(t, k)| (k == &target_key && t != target_id).then(|| t.clone())) {
                warn!(target_id, conflicting_with = existing_target, "duplicate target key rejected");
                return Err(ReverserError::DuplicateTarget(target_key));
            }
            keys.insert(target_id.to_string(), target_key.clone());
        }

        let key = RepoBranchKey::new(target_key.normalized_repo_url.clone(), target_key.branch.clone());
        self.supervisor.register_target(key.clone(), target_id, &target_key.base_path, reconciler, resources).await;
        self.routes.lock().unwrap().insert(target_id.to_string(), key);
        Ok(())
    }

    /// Remove a Target's routing entirely, stopping its worker if it was
    /// the last Target relying on it.
    pub async fn unregister_target(&self, target_id: &str, resources: &WorkerResources) {
        self.target_keys.lock().unwrap().remove(target_id);
        let key = self.routes.lock().unwrap().remove(target_id);
        if let Some(key) = key {
            self.supervisor.unregister_target(key, target_id, resources).await;
        }
    }

    fn record_miss(&self, event: &CapturedEvent, reason: &str) {
        self.route_misses.fetch_add(1, Ordering::Relaxed);
        let mut log = self.dead_letter.lock().unwrap();
        log.record(RouteMissRecord {
            timestamp: Utc::now(),
            namespace: event.identifier.namespace.clone(),
            name: event.identifier.name.clone(),
            reason: reason.to_string(),
        });
        if let Err(e) = log.write_to_file(&self.dead_letter_path) {
            warn!(error = %e, "failed to persist dead-letter record");
        }
        log.clear();
    }
}

impl EventDispatcher for EventRouter {
    fn dispatch(&self, event: CapturedEvent) {
        let key = self.routes.lock().unwrap().get(&event.target_id).cloned();
        let Some(key) = key else {
            self.record_miss(&event, "no route registered for this target");
            return;
        };

        let target_id = event.target_id.clone();
        match self.supervisor.dispatch(&key, event) {
            DispatchOutcome::Delivered => {}
            DispatchOutcome::RouteMiss => {
                warn!(target_id, "route miss: worker not running for this repo/branch, folder reconciler will heal it");
                self.route_misses.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::QueueFull => {
                self.queue_full_drops.fetch_add(1, Ordering::Relaxed);
                warn!(target_id, "branch worker input queue full, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::{GroupVersionResource, ObjectIdentifier, Operation, StructuredDocument, UserInfo};
    use std::process::Command;
    use tempfile::tempdir;

    fn init_bare_remote(dir: &std::path::Path) {
        Command::new("git").args(["init", "--bare", "-b", "main"]).current_dir(dir).output().unwrap();
    }

    fn seed_commit(remote: &std::path::Path) {
        let scratch = tempdir().unwrap();
        Command::new("git").args(["clone", &remote.to_string_lossy(), &scratch.path().to_string_lossy()]).output().unwrap();
        Command::new("git").args(["config", "user.email", "seed@example.com"]).current_dir(scratch.path()).output().unwrap();
        Command::new("git").args(["config", "user.name", "Seed"]).current_dir(scratch.path()).output().unwrap();
        std::fs::write(scratch.path().join("README.md"), "seed\n").unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(scratch.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "seed"]).current_dir(scratch.path()).output().unwrap();
        Command::new("git").args(["push", "origin", "main"]).current_dir(scratch.path()).output().unwrap();
    }

    fn resources(clone_root: PathBuf) -> WorkerResources {
        WorkerResources {
            clone_root,
            default_branch: "main".to_string(),
            push_policy: PushPolicy { interval: Duration::from_secs(3600), max_commits: 1 },
            retry_policy: RetryStrategyConfig::default(),
            reconcile_interval: Duration::from_secs(3600),
            encryptor: None,
            secret_resource: None,
            queue_capacity: 16,
            shutdown_grace_period: Duration::from_secs(5),
        }
    }

    fn event(target_id: &str, name: &str) -> CapturedEvent {
        CapturedEvent {
            operation: Operation::Create,
            identifier: ObjectIdentifier::namespaced(GroupVersionResource::new("", "v1", "configmaps"), "team", name),
            object: Some(StructuredDocument::new(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "team"},
                "data": {"foo": "1"}
            }))),
            user: UserInfo { username: "alice".to_string(), groups: vec![] },
            target_id: target_id.to_string(),
            admitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_without_registration_counts_as_route_miss() {
        let td = tempdir().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new());
        let router = EventRouter::new(supervisor, td.path().join("dead-letter.jsonl"));

        router.dispatch(event("unknown-target", "cm-a"));

        assert_eq!(router.counters(), (1, 0));
    }

    #[tokio::test]
    async fn register_then_dispatch_delivers_to_worker() {
        let remote_td = tempdir().unwrap();
        init_bare_remote(remote_td.path());
        seed_commit(remote_td.path());

        let work_td = tempdir().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new());
        let router = EventRouter::new(supervisor, work_td.path().join("dead-letter.jsonl"));
        let res = resources(work_td.path().join("clones"));

        let key = TargetKey::new(remote_td.path().to_string_lossy().to_string(), "main", "live");
        router.register_target("t1", key, None, &res).await.unwrap();

        router.dispatch(event("t1", "cm-a"));

        assert_eq!(router.counters(), (0, 0));
    }

    #[tokio::test]
    async fn duplicate_target_key_is_rejected() {
        let remote_td = tempdir().unwrap();
        init_bare_remote(remote_td.path());
        seed_commit(remote_td.path());

        let work_td = tempdir().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new());
        let router = EventRouter::new(supervisor, work_td.path().join("dead-letter.jsonl"));
        let res = resources(work_td.path().join("clones"));

        let key = TargetKey::new(remote_td.path().to_string_lossy().to_string(), "main", "live");
        router.register_target("t1", key.clone(), None, &res).await.unwrap();

        let err = router.register_target("t2", key, None, &res).await.unwrap_err();
        assert!(matches!(err, ReverserError::DuplicateTarget(_)));
    }

    #[tokio::test]
    async fn unregister_last_target_stops_the_worker() {
        let remote_td = tempdir().unwrap();
        init_bare_remote(remote_td.path());
        seed_commit(remote_td.path());

        let work_td = tempdir().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new());
        let router = EventRouter::new(supervisor, work_td.path().join("dead-letter.jsonl"));
        let res = resources(work_td.path().join("clones"));

        let key = TargetKey::new(remote_td.path().to_string_lossy().to_string(), "main", "live");
        router.register_target("t1", key, None, &res).await.unwrap();
        router.unregister_target("t1", &res).await;

        router.dispatch(event("t1", "cm-a"));
        assert_eq!(router.counters(), (1, 0));
    }

    #[tokio::test]
    async fn two_targets_sharing_repo_and_branch_use_distinct_base_paths() {
        let remote_td = tempdir().unwrap();
        init_bare_remote(remote_td.path());
        seed_commit(remote_td.path());

        let work_td = tempdir().unwrap();
        let supervisor = Arc::new(WorkerSupervisor::new());
        let router = EventRouter::new(supervisor, work_td.path().join("dead-letter.jsonl"));
        let res = resources(work_td.path().join("clones"));

        let repo_url = remote_td.path().to_string_lossy().to_string();
        router
            .register_target("t1", TargetKey::new(repo_url.clone(), "main", "live-a"), None, &res)
            .await
            .unwrap();
        router
            .register_target("t2", TargetKey::new(repo_url, "main", "live-b"), None, &res)
            .await
            .unwrap();

        router.dispatch(event("t1", "cm-a"));
        router.dispatch(event("t2", "cm-b"));

        assert_eq!(router.counters(), (0, 0));
    }
}
