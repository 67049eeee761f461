use super::AppDefinition;
use crate::error::{Result, TerraceError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Catalogue of installable applications.
pub trait AppRepository: Send + Sync {
    fn find(&self, name: &str) -> Result<AppDefinition>;

    fn list(&self) -> Vec<AppDefinition>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAppRepository {
    apps: BTreeMap<String, AppDefinition>,
}

impl InMemoryAppRepository {
    pub fn new(apps: impl IntoIterator<Item = AppDefinition>) -> Self {
        Self {
            apps: apps.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }

    /// Load every `*.yaml` / `*.yml` file in `dir` as an app definition.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut apps = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !path.is_file() || !is_yaml {
                continue;
            }
            let def = AppDefinition::load(&path).map_err(|e| {
                TerraceError::Validation(format!("{}: {e}", path.display()))
            })?;
            debug!(app = %def.name, path = %path.display(), "loaded app definition");
            apps.push(def);
        }
        Ok(Self::new(apps))
    }
}

impl AppRepository for InMemoryAppRepository {
    fn find(&self, name: &str) -> Result<AppDefinition> {
        self.apps
            .get(name)
            .cloned()
            .ok_or_else(|| TerraceError::AppNotFound(name.to_string()))
    }

    fn list(&self) -> Vec<AppDefinition> {
        self.apps.values().cloned().collect()
    }
}
