//! [`RepositoryProber`] backed by the `git` binary, the same
//! shell-out-to-`git` approach `reverser-git` uses for the Branch Worker's
//! own clone/fetch/push calls.
//!
//! `probe` only checks that the remote answers `ls-remote` for the
//! canonical URL; it has no resolved secret material to authenticate with
//! (the trait only carries a [`CredentialsRef`] description, not the Secret
//! contents), so a private repository behind SSH or a token will report
//! reachable-but-unauthenticated here and only fail for real on the Branch
//! Worker's first clone, whose [`reverser_retry::GitFailureKind`]
//! classification then drives the Target's `SyncStatus` condition.

use std::process::Command;
use std::time::Duration;

use reverser_controllers::RepositoryProber;
use reverser_types::CredentialsRef;

pub struct GitRepositoryProber {
    timeout: Duration,
}

impl Default for GitRepositoryProber {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10) }
    }
}

impl GitRepositoryProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RepositoryProber for GitRepositoryProber {
    fn probe(&self, canonical_url: &str, _credentials: &CredentialsRef) -> Result<(), String> {
        let mut child = Command::new("git")
            .args(["ls-remote", canonical_url])
            .env("GIT_TERMINAL_PROMPT", "0")
            .spawn()
            .map_err(|e| format!("failed to spawn git: {e}"))?;

        let deadline = std::time::Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return if status.success() { Ok(()) } else { Err(format!("git ls-remote exited with {status}")) };
                }
                Ok(None) if std::time::Instant::now() >= deadline => {
                    let _ = child.kill();
                    return Err(format!("probing {canonical_url} timed out after {:?}", self.timeout));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => return Err(format!("failed to wait for git: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as Cmd;
    use tempfile::tempdir;

    #[test]
    fn probes_a_reachable_local_bare_repo() {
        let td = tempdir().unwrap();
        Cmd::new("git").args(["init", "--bare", "-b", "main"]).current_dir(td.path()).output().unwrap();

        let prober = GitRepositoryProber::default();
        let creds = CredentialsRef::HttpToken { secret_name: "s".to_string(), token_key: "t".to_string() };
        assert!(prober.probe(&td.path().to_string_lossy(), &creds).is_ok());
    }

    #[test]
    fn reports_error_for_nonexistent_repo() {
        let td = tempdir().unwrap();
        let missing = td.path().join("does-not-exist");

        let prober = GitRepositoryProber::default();
        let creds = CredentialsRef::HttpToken { secret_name: "s".to_string(), token_key: "t".to_string() };
        assert!(prober.probe(&missing.to_string_lossy(), &creds).is_err());
    }
}
