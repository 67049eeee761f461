//! External systems the bootstrapper and environment setup drive.
//!
//! Chart installation and key generation shell out to `helm` and
//! `ssh-keygen`. The repository host and store opener are seams only; the
//! caller provides implementations.

use crate::error::{Result, TerraceError};
use crate::store::Store;
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

// ---------------------------------------------------------------------------
// Charts
// ---------------------------------------------------------------------------

/// One chart installation. Installs always wait for resources and jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRelease {
    pub chart: String,
    pub release: String,
    pub namespace: String,
    pub create_namespace: bool,
    pub include_crds: bool,
    pub values: Value,
    pub timeout: Duration,
}

impl ChartRelease {
    pub fn new(chart: &str, release: &str, namespace: &str, values: Value) -> Self {
        Self {
            chart: chart.to_string(),
            release: release.to_string(),
            namespace: namespace.to_string(),
            create_namespace: true,
            include_crds: false,
            values,
            timeout: Duration::from_secs(20 * 60),
        }
    }
}

#[async_trait]
pub trait ChartInstaller: Send + Sync {
    async fn install(&self, release: &ChartRelease) -> Result<()>;
}

/// Installs charts from a local directory with the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    charts_dir: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl HelmCli {
    pub fn new(charts_dir: impl Into<PathBuf>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            charts_dir: charts_dir.into(),
            kubeconfig,
        }
    }

    fn args(&self, r: &ChartRelease) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            r.release.clone(),
            self.charts_dir.join(&r.chart).display().to_string(),
            "--namespace".to_string(),
            r.namespace.clone(),
            "--wait".to_string(),
            "--wait-for-jobs".to_string(),
            "--timeout".to_string(),
            format!("{}s", r.timeout.as_secs()),
            "--values".to_string(),
            "-".to_string(),
        ];
        if r.create_namespace {
            args.push("--create-namespace".to_string());
        }
        if !r.include_crds {
            args.push("--skip-crds".to_string());
        }
        if let Some(cfg) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(cfg.display().to_string());
        }
        args
    }
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn install(&self, r: &ChartRelease) -> Result<()> {
        let bin = which::which("helm")
            .map_err(|_| TerraceError::external("helm", "helm not found on PATH"))?;
        let mut child = Command::new(bin)
            .args(self.args(r))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TerraceError::external("helm", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            let values = serde_json::to_vec(&r.values)?;
            stdin
                .write_all(&values)
                .await
                .map_err(|e| TerraceError::external("helm", format!("failed to write values: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TerraceError::external("helm", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let hint = stderr.trim().chars().take(500).collect::<String>();
            return Err(TerraceError::external(
                "helm",
                format!("install of {} failed: {hint}", r.release),
            ));
        }
        info!(release = %r.release, namespace = %r.namespace, "installed chart");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Authorized-keys line.
    pub public: String,
    /// PEM / OpenSSH private key.
    pub private: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, comment: &str) -> Result<KeyPair>;
}

/// Generates ed25519 keys with `ssh-keygen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, comment: &str) -> Result<KeyPair> {
        let bin = which::which("ssh-keygen")
            .map_err(|_| TerraceError::external("ssh-keygen", "ssh-keygen not found on PATH"))?;
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("key");
        let output = Command::new(bin)
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TerraceError::external("ssh-keygen", e))?;
        if !output.status.success() {
            return Err(TerraceError::external(
                "ssh-keygen",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(KeyPair {
            public: tokio::fs::read_to_string(path.with_extension("pub")).await?.trim().to_string(),
            private: tokio::fs::read_to_string(&path).await?,
        })
    }
}

// ---------------------------------------------------------------------------
// Repository host
// ---------------------------------------------------------------------------

/// Administrative access to the host serving the config repositories.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Host address as seen by cluster workloads.
    fn address(&self) -> String;

    fn repo_address(&self, repo: &str) -> String;

    async fn public_key(&self) -> Result<String>;

    async fn add_user(&self, user: &str, public_key: &str) -> Result<()>;

    async fn make_user_admin(&self, user: &str) -> Result<()>;

    async fn add_public_key(&self, user: &str, public_key: &str) -> Result<()>;

    async fn remove_public_key(&self, user: &str, public_key: &str) -> Result<()>;

    async fn add_repository(&self, name: &str, readme: &str) -> Result<()>;

    async fn add_read_write_collaborator(&self, repo: &str, user: &str) -> Result<()>;
}

#[async_trait]
pub trait RepoHostConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr, key: &KeyPair) -> Result<Arc<dyn RepoHost>>;
}

/// Opens a working copy of a repository as a [`Store`].
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open(&self, address: &str, key: &KeyPair) -> Result<Arc<Store>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helm_args_cover_release_settings() {
        let helm = HelmCli::new("/charts", None);
        let mut r = ChartRelease::new("metallb", "metallb", "metallb-system", Value::Null);
        r.include_crds = true;
        let args = helm.args(&r);
        assert_eq!(&args[..4], ["upgrade", "--install", "metallb", "/charts/metallb"]);
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(!args.contains(&"--skip-crds".to_string()));
        assert!(args.contains(&"1200s".to_string()));
    }

    #[test]
    fn key_pair_debug_hides_private_key() {
        let k = KeyPair {
            public: "ssh-ed25519 AAAA".into(),
            private: "SECRET".into(),
        };
        assert!(!format!("{k:?}").contains("SECRET"));
    }

    #[tokio::test]
    async fn ssh_keygen_produces_a_pair() {
        if which::which("ssh-keygen").is_err() {
            return;
        }
        let pair = SshKeygen.generate("bootstrap").await.unwrap();
        assert!(pair.public.starts_with("ssh-ed25519 "), "{}", pair.public);
        assert!(pair.public.ends_with("bootstrap"));
        assert!(pair.private.contains("PRIVATE KEY"));
    }
}
