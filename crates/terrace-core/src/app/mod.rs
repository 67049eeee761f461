//! Application definitions and rendering.
//!
//! An [`AppDefinition`] is a bundle of template strings. [`render`] evaluates
//! all of them against one context built from the environment config, the
//! release parameters and the caller's values:
//!
//! ```text
//! global   EnvConfig fields (camelCase) plus `networks`
//! release  appInstanceId, namespace, repoAddr, appDir
//! values   user supplied values
//! ```
//!
//! Rendering is pure. Nothing touches the store until every template has
//! evaluated successfully.

mod repository;
mod template;

pub use repository::{AppRepository, InMemoryAppRepository};
pub use template::TemplateEngine;

use crate::env::{networks, EnvConfig};
use crate::error::{Result, TerraceError};
use crate::ports::PortForward;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// User supplied values for one render.
pub type Values = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub name: String,
    /// Short namespace names; a [`crate::namespace::NamespaceNames`] turns
    /// them into real ones. The first is the release namespace.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Renders to a YAML document stored as the instance's `config` field.
    #[serde(default)]
    pub config: Option<String>,
    /// Resource file name to template.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Extra files placed next to the instance config.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub readme: String,
    /// Renders to a YAML list of port forwards.
    #[serde(default)]
    pub ports: Option<String>,
}

impl AppDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let def: Self = serde_yaml::from_str(raw)?;
        if def.name.trim().is_empty() {
            return Err(TerraceError::Validation("app definition has no name".into()));
        }
        Ok(def)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }
}

/// Parameters of a single render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub app_instance_id: String,
    pub namespace: String,
    pub repo_addr: String,
    pub app_dir: String,
}

/// Persisted at `<appDir>/config.yaml` and `<appDir>/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// Directory name of the instance; filled in on read.
    #[serde(skip)]
    pub id: String,
    pub app_id: String,
    pub release: Release,
    #[serde(default)]
    pub input: Values,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub name: String,
    pub config: InstanceConfig,
    pub resources: BTreeMap<String, Vec<u8>>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub readme: String,
    pub ports: Vec<PortForward>,
}

fn context(release: &Release, env: &EnvConfig, values: &Values) -> Result<minijinja::Value> {
    let mut global = serde_json::to_value(env)?;
    if let Some(obj) = global.as_object_mut() {
        obj.insert("networks".into(), serde_json::to_value(networks(env))?);
    }
    let ctx = serde_json::json!({
        "global": global,
        "release": release,
        "values": values,
    });
    Ok(minijinja::Value::from_serialize(&ctx))
}

/// Evaluate every template of `def`.
pub fn render(
    engine: &TemplateEngine,
    def: &AppDefinition,
    release: &Release,
    env: &EnvConfig,
    values: &Values,
) -> Result<Rendered> {
    let ctx = context(release, env, values)?;
    let label = |part: &str| format!("{}/{part}", def.name);

    let config = match &def.config {
        Some(t) => {
            let out = engine.render(&label("config"), t, &ctx)?;
            serde_yaml::from_str::<serde_json::Value>(&out).map_err(|e| TerraceError::Template {
                name: label("config"),
                message: format!("rendered config is not valid YAML: {e}"),
            })?
        }
        None => serde_json::Value::Null,
    };

    let mut resources = BTreeMap::new();
    for (name, t) in &def.resources {
        let out = engine.render(&label(name), t, &ctx)?;
        resources.insert(name.clone(), out.into_bytes());
    }

    let mut data = BTreeMap::new();
    for (name, t) in &def.data {
        let out = engine.render(&label(name), t, &ctx)?;
        data.insert(name.clone(), out.into_bytes());
    }

    let readme = engine.render(&label("readme"), &def.readme, &ctx)?;

    let ports = match &def.ports {
        Some(t) => {
            let out = engine.render(&label("ports"), t, &ctx)?;
            if out.trim().is_empty() {
                Vec::new()
            } else {
                serde_yaml::from_str(&out).map_err(|e| TerraceError::Template {
                    name: label("ports"),
                    message: format!("rendered ports are not a port list: {e}"),
                })?
            }
        }
        None => Vec::new(),
    };

    Ok(Rendered {
        name: def.name.clone(),
        config: InstanceConfig {
            id: release.app_instance_id.clone(),
            app_id: def.name.clone(),
            release: release.clone(),
            input: values.clone(),
            config,
        },
        resources,
        data,
        readme,
        ports,
    })
}
