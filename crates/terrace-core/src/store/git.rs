//! Transport backed by the `git` command line client.
//!
//! The working tree must already be a clone whose `origin` remote points at
//! the upstream repository. When an SSH key is configured it is passed to
//! git through `GIT_SSH_COMMAND`.

use super::{transport_error, PullOutcome, Signature, Transport};
use crate::error::{Result, TerraceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GitCli {
    address: String,
    remote: String,
    ssh_key: Option<PathBuf>,
}

impl GitCli {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            remote: "origin".to_string(),
            ssh_key: None,
        }
    }

    pub fn with_ssh_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(key.into());
        self
    }

    /// Read the `origin` URL of an existing clone.
    pub async fn from_worktree(worktree: &Path) -> Result<Self> {
        let unnamed = Self::new(String::new());
        let url = unnamed
            .git(worktree, &["remote", "get-url", "origin"])
            .await?;
        Ok(Self::new(url.trim()))
    }

    fn command(&self, worktree: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(worktree).args(args);
        if let Some(key) = &self.ssh_key {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key.display()
                ),
            );
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn git(&self, worktree: &Path, args: &[&str]) -> Result<String> {
        which::which("git").map_err(|_| transport_error("git", "git binary not found on PATH"))?;
        let subcommand = args
            .iter()
            .find(|a| !a.starts_with('-') && !a.contains('='))
            .copied()
            .unwrap_or("git");
        let output = self
            .command(worktree, args)
            .output()
            .await
            .map_err(|e| transport_error(&format!("git {subcommand}"), e))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let hint = stderr.trim().chars().take(500).collect::<String>();
            return Err(TerraceError::Transport(format!(
                "git {subcommand} failed: {hint}"
            )));
        }
        debug!(cmd = subcommand, "git ok");
        Ok(stdout)
    }
}

#[async_trait]
impl Transport for GitCli {
    fn full_address(&self) -> String {
        self.address.clone()
    }

    async fn pull(&self, worktree: &Path) -> Result<PullOutcome> {
        let out = self
            .git(worktree, &["pull", "--ff-only", "--no-rebase", &self.remote])
            .await?;
        if out.contains("Already up to date") || out.contains("Already up-to-date") {
            Ok(PullOutcome::UpToDate)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    async fn commit_and_push(
        &self,
        worktree: &Path,
        message: &str,
        author: &Signature,
    ) -> Result<()> {
        self.git(worktree, &["add", "--all"]).await?;
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.git(
            worktree,
            &[
                "-c",
                &name,
                "-c",
                &email,
                "commit",
                "--allow-empty",
                "--quiet",
                "-m",
                message,
            ],
        )
        .await?;
        self.git(worktree, &["push", "--quiet", &self.remote, "HEAD"])
            .await?;
        Ok(())
    }

    async fn discard(&self, worktree: &Path, touched: &[String]) -> Result<()> {
        for path in touched {
            let spec = if path.is_empty() { "." } else { path.as_str() };
            // Fails for paths HEAD does not know; there is nothing to restore then.
            let _ = self
                .git(worktree, &["checkout", "--quiet", "HEAD", "--", spec])
                .await;
            self.git(worktree, &["clean", "-fdq", "--", spec]).await?;
        }
        Ok(())
    }
}
