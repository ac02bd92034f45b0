//! Branch Worker, the heart of the system.
//!
//! One task owns exactly one local clone of one (repository, branch),
//! processes events strictly in arrival order, and is the only piece of
//! code ever allowed to touch that clone's files. Everything here runs on
//! a single Tokio task per worker; Git calls themselves are blocking (they
//! shell out to the `git` binary) and are pushed onto the blocking thread
//! pool with `spawn_blocking` so they never stall the task's event loop
//! for other workers.
//!
//! Commits are produced immediately as each event is processed (cheap,
//! local, and what makes "commit order equals enqueue order" trivially
//! true), while the **push** is what's actually batched on the
//! interval/max-commits policy — pushing is the only step that talks to
//! the network. The "batch" the FlushPending state drains is therefore a
//! count of not-yet-pushed local commits, not a queue of uncommitted
//! events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reverser_encrypt::SecretEncryptor;
use reverser_git::GitRepo;
use reverser_retry::{GitFailureKind, RetryStrategyConfig, calculate_delay};
use reverser_sanitizer::canonicalize_yaml;
use reverser_types::{CapturedEvent, GroupVersionResource, ObjectIdentifier, Operation, PushPolicy, StructuredDocument, UserInfo};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Injected by the assembler so this crate never depends on the cluster
/// listing or path-walking machinery that implements §4.7; see
/// `reverser-reconciler` for the concrete implementation.
pub trait FolderReconciler: Send + Sync {
    fn reconcile(&self, clone_dir: &Path, base_path: &str) -> Vec<ReconcileChange>;
}

/// One synthetic change the Folder Reconciler wants injected into the
/// owning worker, through the same path live events take so ordering
/// guarantees hold for both.
#[derive(Debug, Clone)]
pub struct ReconcileChange {
    pub operation: Operation,
    pub identifier: ObjectIdentifier,
    pub object: Option<StructuredDocument>,
}

pub const RECONCILER_USERNAME: &str = "gitops-reverser-reconciler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
    FlushPending,
    Recovering,
    Terminating,
}

/// Resources and policy a single Branch Worker needs. One instance exists
/// per (repository, branch); see `reverser-router` for how Targets sharing
/// a (repo, branch) share one `BranchWorkerConfig`'s worker.
pub struct BranchWorkerConfig {
    /// Parallel to `base_paths`: `target_ids[i]` owns `base_paths[i]`. More
    /// than one entry means several Targets share this (repository, branch)
    /// but each still gets its own base path — the worker registry key is
    /// coarser than the Target uniqueness key.
    pub target_ids: Vec<String>,
    pub repo_url: String,
    pub branch: String,
    pub default_branch: String,
    pub clone_dir: PathBuf,
    pub base_paths: Vec<String>,
    pub push_policy: PushPolicy,
    pub retry_policy: RetryStrategyConfig,
    pub reconcile_interval: Duration,
    /// Resources (per relative path, keyed by GVR) that must be encrypted;
    /// `None` means no Target behind this worker opted into encryption.
    pub encryptor: Option<Arc<dyn SecretEncryptor>>,
    pub secret_resource: Option<GroupVersionResource>,
    /// Keyed by target ID: each Target's rules produce a different live-set
    /// to reconcile against, so one worker serving several Targets needs one
    /// reconciler per Target, not one shared across all of them.
    pub reconcilers: std::collections::HashMap<String, Arc<dyn FolderReconciler>>,
    /// Inbound channel capacity: bounded, back-pressure surfaces through
    /// the enqueue result rather than blocking the admission path.
    pub queue_capacity: usize,
}

/// Snapshot of a worker's observable state, published up to every Target's
/// `SyncStatus`/`WorkerHealthy` status conditions.
#[derive(Debug, Clone)]
pub struct WorkerStatusSnapshot {
    pub state: WorkerState,
    pub last_commit: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub pending_commits: u32,
    pub encryption_failures: u64,
}

struct WorkerStatus {
    state: watch::Sender<WorkerState>,
    last_commit: Mutex<Option<String>>,
    last_sync_time: Mutex<Option<DateTime<Utc>>>,
    healthy: std::sync::atomic::AtomicBool,
    pending_commits: AtomicU32,
    encryption_failures: AtomicU64,
}

impl WorkerStatus {
    fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(WorkerState::Initializing);
        Arc::new(Self {
            state: tx,
            last_commit: Mutex::new(None),
            last_sync_time: Mutex::new(None),
            healthy: std::sync::atomic::AtomicBool::new(true),
            pending_commits: AtomicU32::new(0),
            encryption_failures: AtomicU64::new(0),
        })
    }

    fn set_state(&self, state: WorkerState) {
        // No receiver is kept around (state is polled via `snapshot`, not
        // watched); `send_replace` always updates regardless of whether
        // any receiver is listening.
        self.state.send_replace(state);
    }

    async fn record_commit(&self, hash: String) {
        *self.last_commit.lock().await = Some(hash);
    }

    async fn record_sync(&self, when: DateTime<Utc>) {
        *self.last_sync_time.lock().await = Some(when);
    }

    async fn snapshot(&self) -> WorkerStatusSnapshot {
        WorkerStatusSnapshot {
            state: *self.state.borrow(),
            last_commit: self.last_commit.lock().await.clone(),
            last_sync_time: *self.last_sync_time.lock().await,
            healthy: self.healthy.load(Ordering::Relaxed),
            pending_commits: self.pending_commits.load(Ordering::Relaxed),
            encryption_failures: self.encryption_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("worker input queue is full")]
    QueueFull,
    #[error("worker has shut down")]
    WorkerGone,
}

enum WorkerMessage {
    Event(CapturedEvent),
    Shutdown(oneshot::Sender<()>),
}

/// A cheap, cloneable reference to a running Branch Worker task.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    status: Arc<WorkerStatus>,
}

impl WorkerHandle {
    /// Non-blocking enqueue. Back-pressure (a full queue) is reported to
    /// the caller rather than ever blocking the admission path.
    pub fn try_send_event(&self, event: CapturedEvent) -> Result<(), EnqueueError> {
        self.tx.try_send(WorkerMessage::Event(event)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::WorkerGone,
        })
    }

    pub async fn status(&self) -> WorkerStatusSnapshot {
        self.status.snapshot().await
    }

    /// Signal the worker to drain and stop, waiting up to `grace_period`.
    /// Returns `true` if the worker acknowledged shutdown before the grace
    /// period elapsed.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WorkerMessage::Shutdown(ack_tx)).await.is_err() {
            return true; // already gone
        }
        tokio::time::timeout(grace_period, ack_rx).await.is_ok()
    }
}

/// Spawn a Branch Worker task and return a handle to it immediately; the
/// worker performs its own Initializing-state clone in the background.
pub fn spawn(config: BranchWorkerConfig) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
    let status = WorkerStatus::new();
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let handle = WorkerHandle { tx, status: status.clone() };
    let join = tokio::spawn(run(config, rx, status));
    (handle, join)
}

async fn run(config: BranchWorkerConfig, mut rx: mpsc::Receiver<WorkerMessage>, status: Arc<WorkerStatus>) {
    status.set_state(WorkerState::Initializing);

    let repo = match initialize(&config, &status).await {
        Some(repo) => repo,
        None => {
            status.set_state(WorkerState::Terminating);
            return;
        }
    };

    status.set_state(WorkerState::Ready);
    info!(repo_url = %config.repo_url, branch = %config.branch, "branch worker ready");

    let mut flush_interval = tokio::time::interval(config.push_policy.interval);
    flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut reconcile_interval = tokio::time::interval(config.reconcile_interval);
    reconcile_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut push_attempt: u32 = 0;

    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(WorkerMessage::Event(event)) => {
                        if !process_one_event(&config, &repo, &status, event).await {
                            status.set_state(WorkerState::Terminating);
                            break;
                        }
                        if status.pending_commits.load(Ordering::Relaxed) >= config.push_policy.max_commits {
                            push_attempt = flush(&config, &repo, &status, push_attempt).await;
                        }
                    }
                    Some(WorkerMessage::Shutdown(ack)) => {
                        if status.pending_commits.load(Ordering::Relaxed) > 0 {
                            let _ = flush(&config, &repo, &status, push_attempt).await;
                        }
                        status.set_state(WorkerState::Terminating);
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                }
            }
            _ = flush_interval.tick() => {
                if status.pending_commits.load(Ordering::Relaxed) > 0 {
                    push_attempt = flush(&config, &repo, &status, push_attempt).await;
                }
            }
            _ = reconcile_interval.tick() => {
                reconcile_and_apply(&config, &repo, &status).await;
            }
        }
    }

    info!(repo_url = %config.repo_url, branch = %config.branch, "branch worker terminated");
}

async fn initialize(config: &BranchWorkerConfig, status: &Arc<WorkerStatus>) -> Option<GitRepo> {
    let mut attempt: u32 = 0;
    loop {
        let repo_url = config.repo_url.clone();
        let dest = config.clone_dir.clone();
        let branch = config.branch.clone();
        let default_branch = config.default_branch.clone();
        let result = tokio::task::spawn_blocking(move || GitRepo::init_clone(&repo_url, &dest, &branch, &default_branch))
            .await
            .expect("clone task panicked");

        match result {
            Ok(repo) => return Some(repo),
            Err(e) if e.kind == GitFailureKind::Retryable => {
                attempt += 1;
                warn!(attempt, error = %e, "branch worker clone failed, retrying");
                tokio::time::sleep(calculate_delay(&config.retry_policy, attempt)).await;
            }
            Err(e) => {
                error!(error = %e, "branch worker clone failed permanently");
                return None;
            }
        }
    }
}

fn base_path_for_target<'a>(config: &'a BranchWorkerConfig, target_id: &str) -> Option<&'a str> {
    config
        .target_ids
        .iter()
        .zip(config.base_paths.iter())
        .find(|(t, _)| t.as_str() == target_id)
        .map(|(_, base_path)| base_path.as_str())
}

/// Process one event: resolve its path, compare against the working tree
/// for idempotence, apply the change, stage it, and commit immediately.
/// Returns `false` on a filesystem-fatal error — fatal to the worker.
async fn process_one_event(config: &BranchWorkerConfig, repo: &GitRepo, status: &Arc<WorkerStatus>, event: CapturedEvent) -> bool {
    let Some(base_path) = base_path_for_target(config, &event.target_id) else {
        warn!(target_id = %event.target_id, "event for a target this worker no longer serves, dropping");
        return true;
    };
    let rel_path = reverser_path::encode(&event.identifier, base_path);

    let content = match event.operation {
        Operation::Delete => None,
        Operation::Create | Operation::Update => {
            let Some(doc) = &event.object else {
                warn!("upsert event missing object body, skipping");
                return true;
            };
            match render_content(config, &rel_path, doc, status).await {
                Ok(bytes) => Some(bytes),
                Err(()) => return true, // encryption failure: rejected, counted, not fatal to the worker
            }
        }
    };

    if let Some(existing) = repo.read_file(&rel_path) {
        if content.as_deref() == Some(existing.as_slice()) {
            debug!(rel_path, "discarding no-op upsert");
            return true;
        }
    } else if content.is_none() {
        debug!(rel_path, "discarding delete of file that is already absent");
        return true;
    }

    let message = commit_message(&event, &rel_path);
    let author_name = event.user.username.clone();
    let author_email = reverser_git::synthesize_author_email(&event.user.username, "reverser.local");

    let repo = repo.clone();
    let rel_path_owned = rel_path.clone();
    let result = tokio::task::spawn_blocking(move || {
        repo.write_and_commit(&rel_path_owned, content.as_deref(), &author_name, &author_email, &message)
    })
    .await
    .expect("commit task panicked");

    match result {
        Ok(hash) => {
            status.record_commit(hash).await;
            status.pending_commits.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) if e.kind == GitFailureKind::Permanent => {
            error!(error = %e, "filesystem/git error committing event, terminating worker");
            false
        }
        Err(e) => {
            // A commit failure that isn't permanent (e.g. a transient lock
            // contention writing to .git) is surfaced but not fatal; the
            // event is dropped rather than risking a duplicate commit on
            // blind retry, matching the no-silent-corruption stance of the
            // rest of this worker.
            warn!(error = %e, "commit failed, event dropped");
            true
        }
    }
}

async fn render_content(config: &BranchWorkerConfig, rel_path: &str, doc: &StructuredDocument, status: &Arc<WorkerStatus>) -> Result<Vec<u8>, ()> {
    let yaml = canonicalize_yaml(doc).map_err(|_| ())?;
    let is_secret = config
        .secret_resource
        .as_ref()
        .is_some_and(|gvr| doc.group_version().is_some_and(|(g, v)| g == gvr.group && v == gvr.version) && doc.kind() == Some("Secret"));

    if !is_secret {
        return Ok(yaml.into_bytes());
    }

    let Some(encryptor) = &config.encryptor else {
        return Ok(yaml.into_bytes());
    };

    match encryptor.encrypt(&config.clone_dir, rel_path, yaml.as_bytes()) {
        Ok(ciphertext) => Ok(ciphertext),
        Err(e) => {
            status.encryption_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, rel_path, "secret encryption failed, event rejected");
            Err(())
        }
    }
}

fn commit_message(event: &CapturedEvent, rel_path: &str) -> String {
    let kind = event
        .object
        .as_ref()
        .and_then(|d| d.kind())
        .unwrap_or(&event.identifier.gvr.resource);
    let namespace = event.identifier.namespace.as_deref().unwrap_or("-");
    let subject = format!("[{}] {}/{} in ns/{} by user/{}", event.operation.as_tag(), kind, event.identifier.name, namespace, event.user.username);

    format!(
        "{subject}\n\noperation: {}\npath: {rel_path}\ntimestamp: {}\nuser: {}\ntarget: {}\n",
        event.operation,
        event.admitted_at.to_rfc3339(),
        event.user.username,
        event.target_id,
    )
}

/// Push the accumulated local commits. On a conflict, rebase onto the
/// fetched remote and force-push only this worker's own commits — "last
/// writer wins". Returns the next retry attempt counter to carry forward.
async fn flush(config: &BranchWorkerConfig, repo: &GitRepo, status: &Arc<WorkerStatus>, attempt: u32) -> u32 {
    status.set_state(WorkerState::FlushPending);

    let repo_for_push = repo.clone();
    let branch = config.branch.clone();
    let push_result = tokio::task::spawn_blocking(move || repo_for_push.push(&branch)).await.expect("push task panicked");

    match push_result {
        Ok(()) => {
            status.pending_commits.store(0, Ordering::Relaxed);
            status.healthy.store(true, Ordering::Relaxed);
            status.record_sync(Utc::now()).await;
            status.set_state(WorkerState::Ready);
            0
        }
        Err(e) if e.kind == GitFailureKind::Conflict => {
            info!(error = %e, "push rejected, rebasing onto remote");
            if resolve_conflict(config, repo).await {
                status.pending_commits.store(0, Ordering::Relaxed);
                status.healthy.store(true, Ordering::Relaxed);
                status.record_sync(Utc::now()).await;
                status.set_state(WorkerState::Ready);
                0
            } else {
                status.healthy.store(false, Ordering::Relaxed);
                status.set_state(WorkerState::Recovering);
                let next = attempt + 1;
                tokio::time::sleep(calculate_delay(&config.retry_policy, next)).await;
                next
            }
        }
        Err(e) => {
            warn!(error = %e, "push failed, entering recovering state");
            status.healthy.store(false, Ordering::Relaxed);
            status.set_state(WorkerState::Recovering);
            let next = attempt + 1;
            tokio::time::sleep(calculate_delay(&config.retry_policy, next)).await;
            next
        }
    }
}

async fn resolve_conflict(config: &BranchWorkerConfig, repo: &GitRepo) -> bool {
    let repo = repo.clone();
    let branch = config.branch.clone();
    tokio::task::spawn_blocking(move || {
        repo.fetch(&branch).ok();
        if repo.rebase_onto_remote(&branch).is_err() {
            let _ = repo.rebase_abort();
        }
        repo.force_push_own_commits(&branch).is_ok()
    })
    .await
    .unwrap_or(false)
}

async fn reconcile_and_apply(config: &BranchWorkerConfig, repo: &GitRepo, status: &Arc<WorkerStatus>) {
    if config.reconcilers.is_empty() {
        return;
    }

    let repo_for_fetch = repo.clone();
    let branch = config.branch.clone();
    let advanced = tokio::task::spawn_blocking(move || repo_for_fetch.fetch(&branch)).await.unwrap_or(Ok(false));
    if matches!(advanced, Ok(true)) {
        let _ = resolve_conflict(config, repo).await;
    }

    for (target_id, base_path) in config.target_ids.iter().zip(config.base_paths.iter()) {
        let Some(reconciler) = config.reconcilers.get(target_id) else {
            continue;
        };
        let changes = reconciler.reconcile(repo.dir(), base_path);
        for change in changes {
            let event = CapturedEvent {
                operation: change.operation,
                identifier: change.identifier,
                object: change.object,
                user: UserInfo { username: RECONCILER_USERNAME.to_string(), groups: vec![] },
                target_id: target_id.clone(),
                admitted_at: Utc::now(),
            };
            if !process_one_event(config, repo, status, event).await {
                status.set_state(WorkerState::Terminating);
                return;
            }
        }
    }

    if status.pending_commits.load(Ordering::Relaxed) > 0 {
        flush(config, repo, status, 0).await;
    }
}
