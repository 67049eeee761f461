use crate::error::{Result, TerraceError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Creates cluster namespaces. Creating one that already exists succeeds.
#[async_trait]
pub trait NamespaceCreator: Send + Sync {
    async fn create(&self, name: &str) -> Result<()>;
}

/// Namespace creation through the `kubectl` binary.
#[derive(Debug, Clone, Default)]
pub struct KubectlNamespaceCreator {
    kubeconfig: Option<String>,
}

impl KubectlNamespaceCreator {
    pub fn new(kubeconfig: Option<String>) -> Self {
        Self { kubeconfig }
    }
}

#[async_trait]
impl NamespaceCreator for KubectlNamespaceCreator {
    async fn create(&self, name: &str) -> Result<()> {
        let bin = which::which("kubectl")
            .map_err(|_| TerraceError::external("namespace", "kubectl not found on PATH"))?;
        let mut cmd = Command::new(bin);
        if let Some(cfg) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(cfg);
        }
        let output = cmd
            .args(["create", "namespace", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TerraceError::external("namespace", e))?;
        if output.status.success() {
            info!(namespace = name, "created namespace");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
            debug!(namespace = name, "namespace already exists");
            return Ok(());
        }
        Err(TerraceError::external(
            "namespace",
            format!("could not create {name}: {}", stderr.trim()),
        ))
    }
}

/// Accepts every namespace without touching a cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNamespaceCreator;

#[async_trait]
impl NamespaceCreator for NoopNamespaceCreator {
    async fn create(&self, name: &str) -> Result<()> {
        info!(namespace = name, "skipping namespace creation");
        Ok(())
    }
}

/// Derives concrete namespace names from the short names apps declare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceNames {
    prefix: String,
    suffix: String,
}

impl NamespaceNames {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self::new(prefix, "")
    }

    pub fn with_suffix(&self, suffix: impl Into<String>) -> Self {
        Self::new(self.prefix.clone(), suffix)
    }

    pub fn generate(&self, name: &str) -> String {
        format!("{}{name}{}", self.prefix, self.suffix)
    }
}
