//! Install, update, remove and query app instances in the config store.
//!
//! Each instance lives in its own directory:
//!
//! ```text
//! <appDir>/config.yaml              declared state
//! <appDir>/config.json              same, for queries
//! <appDir>/<data file>              extra files rendered by the app
//! <appDir>/resources/kustomization.yaml
//! <appDir>/resources/<resource>     rendered manifests
//! ```
//!
//! and is listed in the manifest of its parent directory, which is in turn
//! linked all the way up to the store root.

use crate::app::{self, AppDefinition, InstanceConfig, Release, Rendered, TemplateEngine, Values};
use crate::env::EnvConfig;
use crate::error::{Result, TerraceError};
use crate::graph;
use crate::namespace::NamespaceCreator;
use crate::paths;
use crate::ports::{self, PortAllocator};
use crate::store::{read_json, read_yaml, write_json, write_yaml, DoOptions, RepoFs, RepoRead, Store};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of one object declared by a rendered resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseResources {
    pub resources: Vec<ResourceRef>,
}

#[derive(Deserialize)]
struct ResourceDoc {
    metadata: Option<ResourceRef>,
}

/// Pull `name`/`namespace` out of every document of every resource file.
pub fn extract_resources(resources: &BTreeMap<String, Vec<u8>>) -> Result<Vec<ResourceRef>> {
    let mut out = Vec::with_capacity(resources.len());
    for (file, contents) in resources {
        let malformed = |message: String| TerraceError::ResourceMetadata {
            name: file.clone(),
            message,
        };
        for doc in serde_yaml::Deserializer::from_slice(contents) {
            let value = serde_yaml::Value::deserialize(doc).map_err(|e| malformed(e.to_string()))?;
            if value.is_null() {
                continue;
            }
            let doc: ResourceDoc =
                serde_yaml::from_value(value).map_err(|e| malformed(e.to_string()))?;
            match doc.metadata {
                Some(meta) if !meta.name.is_empty() => out.push(meta),
                _ => return Err(malformed("missing metadata.name".into())),
            }
        }
    }
    Ok(out)
}

/// Write a rendered app into `app_dir` as one store transaction.
///
/// Whatever was in `app_dir` before is replaced. Reserved data file names
/// are rejected before anything is written.
pub async fn install_app(
    store: &Store,
    app_dir: &str,
    rendered: &Rendered,
    opts: DoOptions,
) -> Result<()> {
    let app_dir = paths::normalize(app_dir)?;
    if app_dir.is_empty() {
        return Err(TerraceError::InvalidPath("/".into()));
    }
    let mut data = Vec::with_capacity(rendered.data.len());
    for (name, contents) in &rendered.data {
        let name = paths::normalize(name)?;
        let first = name.split('/').next().unwrap_or_default();
        if paths::is_reserved_instance_file(&name) || paths::is_reserved_instance_file(first) {
            return Err(TerraceError::NameConflict(name));
        }
        data.push((name, contents));
    }
    let mut resources = Vec::with_capacity(rendered.resources.len());
    for (name, contents) in &rendered.resources {
        let name = paths::normalize(name)?;
        if name == paths::MANIFEST_FILE || name.contains('/') {
            return Err(TerraceError::NameConflict(name));
        }
        resources.push((name, contents));
    }

    let message = format!("install: {}", rendered.name);
    store
        .transact(
            |fs: &dyn RepoFs| {
                fs.remove_dir(&app_dir)?;
                let resources_dir = paths::join(&app_dir, paths::RESOURCES_DIR);
                fs.create_dir(&resources_dir)?;

                write_yaml(fs, &paths::join(&app_dir, paths::INSTANCE_CONFIG_YAML), &rendered.config)?;
                write_json(fs, &paths::join(&app_dir, paths::INSTANCE_CONFIG_JSON), &rendered.config)?;
                for (name, contents) in &data {
                    fs.write(&paths::join(&app_dir, name), contents)?;
                }

                graph::ensure_manifest(fs, &resources_dir)?;
                graph::link_ancestors(fs, &resources_dir)?;
                for (name, contents) in &resources {
                    fs.write(&paths::join(&resources_dir, name), contents)?;
                    graph::add_resource(fs, &resources_dir, name)?;
                }
                debug!(path = %app_dir, resources = resources.len(), "wrote app");
                Ok(message)
            },
            opts,
        )
        .await
}

pub struct AppManager {
    store: Arc<Store>,
    namespaces: Arc<dyn NamespaceCreator>,
    ports: Arc<dyn PortAllocator>,
    app_dir_root: String,
    engine: TemplateEngine,
}

impl AppManager {
    pub fn new(
        store: Arc<Store>,
        namespaces: Arc<dyn NamespaceCreator>,
        ports: Arc<dyn PortAllocator>,
        app_dir_root: &str,
    ) -> Result<Self> {
        Ok(Self {
            store,
            namespaces,
            ports,
            app_dir_root: paths::normalize(app_dir_root)?,
            engine: TemplateEngine::new(),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn app_dir_root(&self) -> &str {
        &self.app_dir_root
    }

    pub fn instance_dir(&self, id: &str) -> String {
        paths::instance_dir(&self.app_dir_root, id)
    }

    /// Environment-wide configuration stored at the store root.
    pub fn config(&self) -> Result<EnvConfig> {
        read_yaml(self.store.as_ref(), paths::ENV_CONFIG_FILE)
    }

    pub fn render(&self, def: &AppDefinition, release: &Release, values: &Values) -> Result<Rendered> {
        let env = self.config()?;
        app::render(&self.engine, def, release, &env, values)
    }

    /// Render `def` and write it to `app_dir`, then request its ports.
    ///
    /// Port requests happen after the commit; if one fails the store
    /// already holds the new instance.
    pub async fn install(
        &self,
        def: &AppDefinition,
        instance_id: &str,
        app_dir: &str,
        namespace: &str,
        values: &Values,
    ) -> Result<ReleaseResources> {
        paths::validate_instance_id(instance_id)?;
        let app_dir = paths::normalize(app_dir)?;
        self.store.pull().await;
        self.namespaces.create(namespace).await?;
        let release = Release {
            app_instance_id: instance_id.to_string(),
            namespace: namespace.to_string(),
            repo_addr: self.store.full_address(),
            app_dir: app_dir.clone(),
        };
        let rendered = self.render(def, &release, values)?;
        let resources = extract_resources(&rendered.resources)?;
        install_app(&self.store, &app_dir, &rendered, DoOptions::default()).await?;
        info!(instance = instance_id, app = %def.name, namespace, "installed app");
        ports::open_ports(self.ports.as_ref(), &rendered.ports).await?;
        Ok(ReleaseResources { resources })
    }

    /// Install under the app root using the instance id as directory name.
    pub async fn install_instance(
        &self,
        def: &AppDefinition,
        instance_id: &str,
        namespace: &str,
        values: &Values,
    ) -> Result<ReleaseResources> {
        let dir = self.instance_dir(instance_id);
        self.install(def, instance_id, &dir, namespace, values).await
    }

    /// Re-render an existing instance with new values. The namespace and
    /// directory come from the stored instance config.
    pub async fn update(
        &self,
        def: &AppDefinition,
        instance_id: &str,
        values: &Values,
        opts: DoOptions,
    ) -> Result<ReleaseResources> {
        self.store.pull().await;
        let current = self.read_instance(instance_id)?;
        let app_dir = if current.release.app_dir.is_empty() {
            self.instance_dir(instance_id)
        } else {
            current.release.app_dir.clone()
        };
        let release = Release {
            app_instance_id: instance_id.to_string(),
            namespace: current.release.namespace,
            repo_addr: self.store.full_address(),
            app_dir: app_dir.clone(),
        };
        let rendered = self.render(def, &release, values)?;
        let resources = extract_resources(&rendered.resources)?;
        install_app(&self.store, &app_dir, &rendered, opts).await?;
        info!(instance = instance_id, app = %def.name, "updated app");
        ports::open_ports(self.ports.as_ref(), &rendered.ports).await?;
        Ok(ReleaseResources { resources })
    }

    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        self.store.pull().await;
        let root = self.app_dir_root.clone();
        let dir = self.instance_dir(instance_id);
        self.store
            .transact(
                |fs: &dyn RepoFs| {
                    let listed = match graph::read_manifest(fs, &root) {
                        Ok(k) => k.contains(instance_id),
                        Err(e) if e.is_not_found() => false,
                        Err(e) => return Err(e),
                    };
                    if !listed && !fs.exists(&dir)? {
                        return Err(TerraceError::InstanceNotFound(instance_id.to_string()));
                    }
                    fs.remove_dir(&dir)?;
                    graph::remove_resource(fs, &root, instance_id)?;
                    Ok(format!("uninstall: {instance_id}"))
                },
                DoOptions::default(),
            )
            .await?;
        info!(instance = instance_id, "removed app");
        Ok(())
    }

    fn read_instance(&self, id: &str) -> Result<InstanceConfig> {
        let path = paths::instance_config_json(&self.app_dir_root, id);
        let mut cfg: InstanceConfig = read_json(self.store.as_ref(), &path).map_err(|e| {
            if e.is_not_found() {
                TerraceError::InstanceNotFound(id.to_string())
            } else {
                e
            }
        })?;
        cfg.id = id.to_string();
        Ok(cfg)
    }

    fn listed_instances(&self) -> Result<Vec<String>> {
        match graph::read_manifest(self.store.as_ref(), &self.app_dir_root) {
            Ok(k) => Ok(k.resources),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn find_instance(&self, id: &str) -> Result<InstanceConfig> {
        if !self.listed_instances()?.iter().any(|i| i == id) {
            return Err(TerraceError::InstanceNotFound(id.to_string()));
        }
        self.read_instance(id)
    }

    /// Every instance listed under the app root. Pulls first.
    pub async fn find_all_instances(&self) -> Result<Vec<InstanceConfig>> {
        self.store.pull().await;
        self.listed_instances()?
            .iter()
            .map(|id| self.read_instance(id))
            .collect()
    }

    /// Instances of the app named `app`.
    pub fn find_all_app_instances(&self, app: &str) -> Result<Vec<InstanceConfig>> {
        let mut out = Vec::new();
        for id in self.listed_instances()? {
            let cfg = self.read_instance(&id)?;
            if cfg.app_id == app {
                out.push(cfg);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for AppManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppManager")
            .field("store", &self.store)
            .field("app_dir_root", &self.app_dir_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NoopNamespaceCreator;
    use crate::ports::NoopPortAllocator;
    use crate::store::LocalTransport;
    use tempfile::TempDir;

    const APP: &str = r#"
name: echo
resources:
  echo.yaml: |
    kind: ConfigMap
    metadata:
      name: echo
      namespace: {{ release.namespace }}
    data:
      greeting: {{ values.Greeting }}
"#;

    async fn setup() -> (TempDir, Arc<LocalTransport>, AppManager) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new("ssh://local/config"));
        let store = Arc::new(Store::new(dir.path(), transport.clone()).unwrap());
        store
            .transact(
                |fs| {
                    write_yaml(fs, "config.yaml", &EnvConfig { id: "dev".into(), ..Default::default() })?;
                    Ok("init".into())
                },
                DoOptions::default(),
            )
            .await
            .unwrap();
        let mgr = AppManager::new(
            store,
            Arc::new(NoopNamespaceCreator),
            Arc::new(NoopPortAllocator),
            "/apps",
        )
        .unwrap();
        (dir, transport, mgr)
    }

    fn greeting(s: &str) -> Values {
        let mut v = Values::new();
        v.insert("Greeting".into(), s.into());
        v
    }

    #[tokio::test]
    async fn install_writes_instance_and_commits() {
        let (_dir, transport, mgr) = setup().await;
        let def = AppDefinition::from_yaml(APP).unwrap();
        let res = mgr
            .install_instance(&def, "echo-a1b", "ns1", &greeting("hi"))
            .await
            .unwrap();
        assert_eq!(
            res.resources,
            vec![ResourceRef { name: "echo".into(), namespace: "ns1".into() }]
        );
        assert_eq!(transport.commits().last().unwrap(), "install: echo");
        let store = mgr.store();
        assert!(store.exists("apps/echo-a1b/config.yaml").unwrap());
        assert_eq!(
            graph::read_manifest(store.as_ref(), "apps/echo-a1b/resources").unwrap().resources,
            vec!["echo.yaml"]
        );
        let found = mgr.find_instance("echo-a1b").unwrap();
        assert_eq!(found.id, "echo-a1b");
        assert_eq!(found.release.namespace, "ns1");
    }

    #[tokio::test]
    async fn invalid_instance_id_is_rejected() {
        let (_dir, transport, mgr) = setup().await;
        let def = AppDefinition::from_yaml(APP).unwrap();
        let err = mgr
            .install_instance(&def, "Bad_Id", "ns1", &greeting("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::InvalidInstanceId(_)));
        assert_eq!(transport.commits().len(), 1);
    }

    #[tokio::test]
    async fn update_of_unknown_instance_is_not_found() {
        let (_dir, _t, mgr) = setup().await;
        let def = AppDefinition::from_yaml(APP).unwrap();
        let err = mgr
            .update(&def, "echo-zzz", &greeting("x"), DoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn remove_unlists_but_keeps_manifest() {
        let (_dir, transport, mgr) = setup().await;
        let def = AppDefinition::from_yaml(APP).unwrap();
        mgr.install_instance(&def, "echo-a1b", "ns1", &greeting("hi"))
            .await
            .unwrap();
        mgr.remove("echo-a1b").await.unwrap();
        assert_eq!(transport.commits().last().unwrap(), "uninstall: echo-a1b");
        assert!(!mgr.store().exists("apps/echo-a1b").unwrap());
        assert!(mgr.find_all_instances().await.unwrap().is_empty());
        assert!(graph::read_manifest(mgr.store().as_ref(), "")
            .unwrap()
            .contains("apps"));
        assert!(matches!(
            mgr.remove("echo-a1b").await.unwrap_err(),
            TerraceError::InstanceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn remove_reports_unreadable_manifest() {
        let (dir, transport, mgr) = setup().await;
        let def = AppDefinition::from_yaml(APP).unwrap();
        mgr.install_instance(&def, "echo-a1b", "ns1", &greeting("hi"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("apps/kustomization.yaml"), "resources: {echo: 1}\n").unwrap();

        let err = mgr.remove("echo-a1b").await.unwrap_err();
        assert!(matches!(err, TerraceError::Yaml(_)), "{err}");
        assert!(mgr.store().exists("apps/echo-a1b").unwrap());
        assert_eq!(transport.commits().last().unwrap(), "install: echo");
    }

    #[tokio::test]
    async fn find_all_app_instances_filters_by_app() {
        let (_dir, _t, mgr) = setup().await;
        let echo = AppDefinition::from_yaml(APP).unwrap();
        let other = AppDefinition {
            name: "other".into(),
            ..Default::default()
        };
        mgr.install_instance(&echo, "echo-1", "ns1", &greeting("a")).await.unwrap();
        mgr.install_instance(&other, "other-1", "ns2", &Values::new()).await.unwrap();
        let echoes = mgr.find_all_app_instances("echo").unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].id, "echo-1");
        assert_eq!(mgr.find_all_instances().await.unwrap().len(), 2);
    }

    #[test]
    fn extract_resources_handles_multiple_documents() {
        let mut files = BTreeMap::new();
        files.insert(
            "a.yaml".to_string(),
            b"metadata:\n  name: one\n---\nmetadata:\n  name: two\n  namespace: x\n".to_vec(),
        );
        let refs = extract_resources(&files).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].namespace, "x");
    }

    #[test]
    fn extract_resources_rejects_missing_metadata() {
        let mut files = BTreeMap::new();
        files.insert("bad.yaml".to_string(), b"kind: ConfigMap\n".to_vec());
        let err = extract_resources(&files).unwrap_err();
        assert!(matches!(err, TerraceError::ResourceMetadata { ref name, .. } if name == "bad.yaml"));
    }
}
