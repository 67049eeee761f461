pub mod app;
pub mod init;

use anyhow::{bail, Context};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use terrace_core::app::{InMemoryAppRepository, Values};
use terrace_core::manager::AppManager;
use terrace_core::namespace::{KubectlNamespaceCreator, NamespaceCreator, NoopNamespaceCreator};
use terrace_core::ports::{HttpPortAllocator, NoopPortAllocator, PortAllocator};
use terrace_core::store::{GitCli, LocalTransport, Store, Transport};

/// Flags shared by every subcommand.
pub struct Globals {
    pub root: PathBuf,
    pub apps_dir: Option<PathBuf>,
    pub app_root: String,
    pub offline: bool,
    pub json: bool,
}

impl Globals {
    pub async fn open_store(&self) -> anyhow::Result<Arc<Store>> {
        let transport: Arc<dyn Transport> = if self.offline {
            Arc::new(LocalTransport::new(format!("file://{}", self.root.display())))
        } else {
            Arc::new(
                GitCli::from_worktree(&self.root)
                    .await
                    .context("reading origin of config repository (use --offline for a local tree)")?,
            )
        };
        let store = Store::new(&self.root, transport)
            .with_context(|| format!("opening store at {}", self.root.display()))?;
        Ok(Arc::new(store))
    }

    pub async fn manager(&self) -> anyhow::Result<AppManager> {
        let store = self.open_store().await?;
        let (namespaces, ports): (Arc<dyn NamespaceCreator>, Arc<dyn PortAllocator>) = if self.offline {
            (Arc::new(NoopNamespaceCreator), Arc::new(NoopPortAllocator))
        } else {
            (
                Arc::new(KubectlNamespaceCreator::new(None)),
                Arc::new(HttpPortAllocator::new()?),
            )
        };
        Ok(AppManager::new(store, namespaces, ports, &self.app_root)?)
    }

    pub fn catalogue(&self) -> anyhow::Result<InMemoryAppRepository> {
        let Some(dir) = &self.apps_dir else {
            bail!("no app catalogue: pass --apps-dir or set TERRACE_APPS_DIR");
        };
        InMemoryAppRepository::load_dir(dir)
            .with_context(|| format!("loading app definitions from {}", dir.display()))
    }
}

pub fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new()?;
    Ok(rt.block_on(fut))
}

/// Parse `key=value` pairs. Values are read as YAML scalars, so `port=53`
/// is a number and `enabled=true` a bool; anything else stays a string.
pub fn parse_values(pairs: &[String]) -> anyhow::Result<Values> {
    let mut values = Values::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid --set '{pair}': expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --set '{pair}': empty key");
        }
        let value = match serde_yaml::from_str::<serde_json::Value>(raw) {
            Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_) | serde_json::Value::String(_))) => v,
            _ => serde_json::Value::String(raw.to_string()),
        };
        values.insert(key.to_string(), value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_values_are_typed_scalars() {
        let values = parse_values(&[
            "Subdomain=dns".to_string(),
            "Port=53".to_string(),
            "Enabled=true".to_string(),
            "Empty=".to_string(),
            "List=[a, b]".to_string(),
        ])
        .unwrap();
        assert_eq!(values["Subdomain"], "dns");
        assert_eq!(values["Port"], 53);
        assert_eq!(values["Enabled"], true);
        assert_eq!(values["Empty"], "");
        assert_eq!(values["List"], "[a, b]");
    }

    #[test]
    fn set_without_equals_is_rejected() {
        assert!(parse_values(&["Subdomain".to_string()]).is_err());
        assert!(parse_values(&["=dns".to_string()]).is_err());
    }
}
