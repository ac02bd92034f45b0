//! Git plumbing for the Branch Worker.
//!
//! Adapted from a git-cleanliness/context-capture helper that only ever
//! read repository state: this crate keeps the "shell out to the `git`
//! binary" approach but adds the write side — clone, create-branch,
//! commit, push, fetch, and rebase — that a read-only context capture
//! never needed.
//!
//! Every fallible Git call returns a [`GitError`] carrying a
//! [`GitFailureKind`] classification rather than a bare error: the
//! worker's Recovering state is driven by that classification, not by
//! pattern-matching error strings at the call site.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use reverser_retry::GitFailureKind;

/// A Git operation failure, classified for the Branch Worker's retry logic.
#[derive(Debug, thiserror::Error)]
#[error("git {operation} failed ({kind:?}): {message}")]
pub struct GitError {
    pub kind: GitFailureKind,
    pub operation: &'static str,
    pub message: String,
}

impl GitError {
    fn new(operation: &'static str, kind: GitFailureKind, message: impl Into<String>) -> Self {
        Self { kind, operation, message: message.into() }
    }
}

/// A local clone of one (repository, branch) owned by exactly one Branch
/// Worker: no other task may touch these files for the worker's lifetime.
/// Cloning a handle is cheap (just the
/// directory path) and is how the worker moves a repo handle into a
/// `spawn_blocking` closure without holding it across an `.await`.
#[derive(Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone `repo_url` at `dest`, checking out `branch`. If `branch`
    /// doesn't exist on the remote, create it from `default_branch`; if
    /// the repository is entirely empty, seed it with an empty initial
    /// commit.
    pub fn init_clone(repo_url: &str, dest: &Path, branch: &str, default_branch: &str) -> Result<Self, GitError> {
        if dest.join(".git").is_dir() {
            return Ok(Self { dir: dest.to_path_buf() });
        }

        std::fs::create_dir_all(dest).map_err(|e| {
            GitError::new("clone", GitFailureKind::Permanent, format!("cannot create clone dir: {e}"))
        })?;

        let clone_branch = run(dest.parent().unwrap_or(dest), &["clone", "--branch", branch, "--single-branch", repo_url, &dest.to_string_lossy()]);
        match clone_branch {
            Ok(_) => return Ok(Self { dir: dest.to_path_buf() }),
            Err(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("Remote branch") && !stderr.contains("not found") {
                    return Err(classify(&output, "clone"));
                }
            }
        }

        // Branch doesn't exist remotely yet: clone the default branch and
        // create the target branch locally from it.
        run(dest.parent().unwrap_or(dest), &["clone", repo_url, &dest.to_string_lossy()])
            .map_err(|o| classify(&o, "clone"))?;

        let repo = Self { dir: dest.to_path_buf() };
        let checkout_default = run(&repo.dir, &["checkout", default_branch]);
        if checkout_default.is_err() {
            // Repository has no commits at all yet: seed one so a branch
            // can exist.
            run(&repo.dir, &["commit", "--allow-empty", "-m", "gitops-reverser: initial commit"])
                .map_err(|o| classify(&o, "commit"))?;
        }
        run(&repo.dir, &["checkout", "-b", branch]).map_err(|o| classify(&o, "checkout"))?;
        Ok(repo)
    }

    /// Open an already-cloned directory without touching the network.
    pub fn open(dest: &Path) -> Result<Self, GitError> {
        if !dest.join(".git").is_dir() {
            return Err(GitError::new("open", GitFailureKind::Permanent, "not a git repository"));
        }
        Ok(Self { dir: dest.to_path_buf() })
    }

    /// Fetch the remote and report whether `branch`'s remote head
    /// advanced past the local one.
    pub fn fetch(&self, branch: &str) -> Result<bool, GitError> {
        let before = self.rev_parse(&format!("refs/remotes/origin/{branch}")).ok();
        run(&self.dir, &["fetch", "origin", branch]).map_err(|o| classify(&o, "fetch"))?;
        let after = self.rev_parse(&format!("refs/remotes/origin/{branch}")).ok();
        Ok(before != after)
    }

    /// Rebase unpushed local commits onto the freshly fetched remote head.
    pub fn rebase_onto_remote(&self, branch: &str) -> Result<(), GitError> {
        run(&self.dir, &["rebase", &format!("origin/{branch}")]).map_err(|o| {
            let stderr = String::from_utf8_lossy(&o.stderr);
            if stderr.contains("CONFLICT") {
                GitError::new("rebase", GitFailureKind::Conflict, stderr.to_string())
            } else {
                classify(&o, "rebase")
            }
        })?;
        Ok(())
    }

    /// Abort an in-progress rebase (used when the worker decides the local
    /// change must win outright rather than rebasing commit-by-commit).
    pub fn rebase_abort(&self) -> Result<(), GitError> {
        run(&self.dir, &["rebase", "--abort"]).map_err(|o| classify(&o, "rebase-abort"))?;
        Ok(())
    }

    /// Write (or delete, when `content` is `None`) the file at
    /// `rel_path`, stage it, and commit with the given author/message.
    pub fn write_and_commit(
        &self,
        rel_path: &str,
        content: Option<&[u8]>,
        author_name: &str,
        author_email: &str,
        message: &str,
    ) -> Result<String, GitError> {
        let full_path = self.dir.join(rel_path);
        match content {
            Some(bytes) => {
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        GitError::new("write", GitFailureKind::Permanent, format!("mkdir failed: {e}"))
                    })?;
                }
                std::fs::write(&full_path, bytes).map_err(|e| {
                    GitError::new("write", GitFailureKind::Permanent, format!("write failed: {e}"))
                })?;
            }
            None => {
                if full_path.exists() {
                    std::fs::remove_file(&full_path).map_err(|e| {
                        GitError::new("write", GitFailureKind::Permanent, format!("remove failed: {e}"))
                    })?;
                }
            }
        }

        run(&self.dir, &["add", "-A", "--", rel_path]).map_err(|o| classify(&o, "add"))?;

        let author = format!("{author_name} <{author_email}>");
        let commit = run(&self.dir, &["commit", "--author", &author, "-m", message]);
        match commit {
            Ok(_) => self.rev_parse("HEAD"),
            Err(o) => {
                let stderr = String::from_utf8_lossy(&o.stderr);
                if stderr.contains("nothing to commit") {
                    // Caller is expected to have already deduped identical
                    // writes; treat this as a no-op success rather than a
                    // failure.
                    self.rev_parse("HEAD")
                } else {
                    Err(classify(&o, "commit"))
                }
            }
        }
    }

    /// Push the current branch to `origin`.
    pub fn push(&self, branch: &str) -> Result<(), GitError> {
        run(&self.dir, &["push", "origin", branch]).map_err(|o| classify(&o, "push"))?;
        Ok(())
    }

    /// Force-push only this worker's own branch ref — "last writer wins".
    /// Never touches any ref but the one this worker owns.
    pub fn force_push_own_commits(&self, branch: &str) -> Result<(), GitError> {
        run(&self.dir, &["push", "--force-with-lease", "origin", branch]).map_err(|o| classify(&o, "push"))?;
        Ok(())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let output = run(&self.dir, &["rev-parse", rev]).map_err(|o| classify(&o, "rev-parse"))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn head_commit(&self) -> Result<String, GitError> {
        self.rev_parse("HEAD")
    }

    pub fn is_clean(&self) -> Result<bool, GitError> {
        let output = run(&self.dir, &["status", "--porcelain"]).map_err(|o| classify(&o, "status"))?;
        Ok(output.stdout.is_empty())
    }

    /// Read `rel_path`'s current committed contents, if it exists.
    pub fn read_file(&self, rel_path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.join(rel_path)).ok()
    }

    pub fn file_exists(&self, rel_path: &str) -> bool {
        self.dir.join(rel_path).is_file()
    }
}

fn run(dir: &Path, args: &[&str]) -> Result<Output, Output> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {args:?}: {e}"));
    if output.status.success() { Ok(output) } else { Err(output) }
}

fn classify(output: &Output, operation: &'static str) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let kind = classify_stderr(&stderr);
    GitError::new(operation, kind, stderr.trim().to_string())
}

/// Heuristically classify a `git` stderr message into a [`GitFailureKind`].
pub fn classify_stderr(stderr: &str) -> GitFailureKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("non-fast-forward")
        || lower.contains("rejected")
        || lower.contains("stale info")
        || lower.contains("conflict")
    {
        GitFailureKind::Conflict
    } else if lower.contains("could not resolve host")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied (publickey)")
    {
        GitFailureKind::Retryable
    } else if lower.contains("corrupt")
        || lower.contains("bad object")
        || lower.contains("not a git repository")
        || lower.contains("no space left")
    {
        GitFailureKind::Permanent
    } else {
        // Unknown errors default to retryable: never drop a commit
        // silently on an error this module hasn't learned to classify.
        GitFailureKind::Retryable
    }
}

/// Synthesize a stable commit author email from a Kubernetes username.
/// Characters outside `[a-z0-9.+-]` are replaced with `-` so exotic
/// usernames (service accounts like `system:serviceaccount:ns:name`)
/// still produce a valid-looking address.
pub fn synthesize_author_email(username: &str, domain: &str) -> String {
    let slug: String = username
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '+' || c == '-' { c } else { '-' })
        .collect();
    format!("{slug}@{domain}")
}
