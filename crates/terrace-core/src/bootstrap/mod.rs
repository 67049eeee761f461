//! Bring up a fresh cluster environment end to end.
//!
//! The bootstrap is one task tree: load balancer, storage, the config
//! repository host, continuous deployment, the initial repository layout,
//! infrastructure services and the environment manager, in that order.
//! A temporary key pair is used to administer the repository host during
//! setup and revoked at the end. Nothing is rolled back on failure.

mod collaborators;

pub use collaborators::{
    ChartInstaller, ChartRelease, HelmCli, KeyGenerator, KeyPair, RepoHost, RepoHostConnector,
    SshKeygen, StoreOpener,
};

use crate::app::{AppRepository, Values};
use crate::env::BootstrapConfig;
use crate::error::{Result, TerraceError};
use crate::graph::{self, Kustomization};
use crate::manager::AppManager;
use crate::namespace::{NamespaceCreator, NamespaceNames};
use crate::ports::PortAllocator;
use crate::store::{write_yaml, DoOptions, Store};
use crate::tasks::{retry_with_backoff, RetryPolicy, Task};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::info;

pub const ADMIN_USER: &str = "admin";
pub const FLUX_USER: &str = "flux";
pub const INFRASTRUCTURE_DIR: &str = "infrastructure";
pub const ENVIRONMENTS_DIR: &str = "environments";

pub const POOL_LOCAL: &str = "local";
pub const POOL_CONFIG_REPO: &str = "config-repo";
pub const POOL_INGRESS_PUBLIC: &str = "ingress-public";

/// Catalogue apps installed under `infrastructure/` during bootstrap.
pub const INFRASTRUCTURE_APPS: &[&str] = &[
    "resource-renderer-controller",
    "headscale-controller",
    "csi-driver-smb",
    "ingress-public",
    "cert-manager",
    "cert-manager-webhook-gandi",
    "cert-manager-webhook-gandi-role",
];

pub const ENV_MANAGER_APP: &str = "env-manager";

/// Manifest file holding the chart repository source.
pub const CHARTS_REPO_FILE: &str = "terrace-charts.yaml";

/// Everything outside this crate the bootstrap talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub charts: Arc<dyn ChartInstaller>,
    pub namespaces: Arc<dyn NamespaceCreator>,
    pub ports: Arc<dyn PortAllocator>,
    pub repo_hosts: Arc<dyn RepoHostConnector>,
    pub stores: Arc<dyn StoreOpener>,
    pub keys: Arc<dyn KeyGenerator>,
    pub apps: Arc<dyn AppRepository>,
}

/// Values produced by one bootstrap phase and consumed by later ones.
#[derive(Default)]
struct Shared {
    bootstrap_keys: OnceLock<KeyPair>,
    host: OnceLock<Arc<dyn RepoHost>>,
    manager: OnceLock<Arc<AppManager>>,
}

fn not_ready(what: &str) -> TerraceError {
    TerraceError::Validation(format!("bootstrap step ran before {what} was available"))
}

impl Shared {
    fn keys(&self) -> Result<&KeyPair> {
        self.bootstrap_keys.get().ok_or_else(|| not_ready("bootstrap keys"))
    }

    fn host(&self) -> Result<Arc<dyn RepoHost>> {
        self.host.get().cloned().ok_or_else(|| not_ready("repository host"))
    }

    fn manager(&self) -> Result<Arc<AppManager>> {
        self.manager.get().cloned().ok_or_else(|| not_ready("config repository"))
    }
}

pub struct Bootstrapper {
    deps: Collaborators,
    connect_retry: RetryPolicy,
}

impl Bootstrapper {
    pub fn new(deps: Collaborators) -> Self {
        Self {
            deps,
            connect_retry: RetryPolicy::default(),
        }
    }

    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    pub async fn run(&self, cfg: BootstrapConfig) -> Result<()> {
        let env = cfg.env_name.clone();
        self.tasks(cfg).execute().await?;
        info!(env = %env, "bootstrap complete");
        Ok(())
    }

    /// The full bootstrap tree for `cfg`.
    pub fn tasks(&self, cfg: BootstrapConfig) -> Task {
        let cfg = Arc::new(cfg);
        let shared = Arc::new(Shared::default());
        Task::sequential(
            format!("Bootstrap {}", cfg.env_name),
            vec![
                self.generate_keys(&shared),
                self.load_balancer(&cfg),
                self.storage(&cfg),
                self.repo_host(&cfg, &shared),
                self.connect(&cfg, &shared),
                self.flux(&cfg, &shared),
                self.init_repo(&cfg, &shared),
                self.infrastructure(&cfg, &shared),
                self.env_manager(&cfg, &shared),
                self.revoke_keys(&shared),
            ],
        )
    }

    fn chart(&self, name: String, release: ChartRelease) -> Task {
        let charts = self.deps.charts.clone();
        Task::leaf(name, move || async move { charts.install(&release).await })
    }

    fn generate_keys(&self, shared: &Arc<Shared>) -> Task {
        let keys = self.deps.keys.clone();
        let shared = shared.clone();
        Task::leaf("Generate bootstrap credentials", move || async move {
            let pair = keys.generate("bootstrap").await?;
            let _ = shared.bootstrap_keys.set(pair);
            Ok(())
        })
    }

    fn load_balancer(&self, cfg: &BootstrapConfig) -> Task {
        let ips = cfg.service_ips;
        let namespace = ChartRelease::new(
            "namespace",
            "metallb-ns",
            &cfg.env_name,
            json!({
                "namespace": "metallb-system",
                "labels": [
                    "pod-security.kubernetes.io/audit: privileged",
                    "pod-security.kubernetes.io/enforce: privileged",
                    "pod-security.kubernetes.io/warn: privileged",
                ],
            }),
        );
        let mut service = ChartRelease::new(
            "metallb",
            "metallb",
            "metallb-system",
            json!({
                "controller": { "image": { "repository": "quay.io/metallb/controller", "tag": "v0.13.9", "pullPolicy": "IfNotPresent" }, "logLevel": "info" },
                "speaker": { "image": { "repository": "quay.io/metallb/speaker", "tag": "v0.13.9", "pullPolicy": "IfNotPresent" }, "logLevel": "info" },
            }),
        );
        service.include_crds = true;
        let pool = |name: &str, auto_assign: bool, from: String, to: String| {
            self.chart(
                format!("Address pool {name}"),
                ChartRelease::new(
                    "metallb-ipaddresspool",
                    name,
                    "metallb-system",
                    json!({ "name": name, "autoAssign": auto_assign, "from": from, "to": to }),
                ),
            )
        };
        Task::sequential(
            "Network load balancer",
            vec![
                self.chart("Namespace".into(), namespace),
                self.chart("Service".into(), service),
                Task::concurrent(
                    "Address pools",
                    vec![
                        pool(POOL_LOCAL, true, ips.from.to_string(), ips.to.to_string()),
                        pool(
                            POOL_CONFIG_REPO,
                            false,
                            ips.config_repo.to_string(),
                            ips.config_repo.to_string(),
                        ),
                        pool(
                            POOL_INGRESS_PUBLIC,
                            false,
                            ips.ingress_public.to_string(),
                            ips.ingress_public.to_string(),
                        ),
                    ],
                ),
            ],
        )
    }

    fn storage(&self, cfg: &BootstrapConfig) -> Task {
        self.chart(
            "Distributed storage".into(),
            ChartRelease::new(
                "longhorn",
                "longhorn",
                "longhorn-system",
                json!({
                    "defaultSettings": { "defaultDataPath": cfg.storage_dir },
                    "persistence": { "defaultClassReplicaCount": cfg.volume_default_replica_count },
                    "service": { "ui": { "type": "LoadBalancer" } },
                    "ingress": { "enabled": false },
                }),
            ),
        )
    }

    fn repo_host(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let charts = self.deps.charts.clone();
        let keys = self.deps.keys.clone();
        let cfg = cfg.clone();
        let shared = shared.clone();
        Task::leaf("Config repository host", move || async move {
            let admin = shared.keys()?.public.clone();
            let host_keys = keys.generate("soft-serve").await?;
            let release = ChartRelease::new(
                "soft-serve",
                "soft-serve",
                &cfg.env_name,
                json!({
                    "image": { "repository": "charmcli/soft-serve", "tag": "v0.5.4", "pullPolicy": "IfNotPresent" },
                    "privateKey": host_keys.private,
                    "publicKey": host_keys.public,
                    "adminKey": admin,
                    "reservedIP": cfg.service_ips.config_repo.to_string(),
                }),
            );
            charts.install(&release).await
        })
    }

    fn connect(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let connector = self.deps.repo_hosts.clone();
        let policy = self.connect_retry;
        let cfg = cfg.clone();
        let shared = shared.clone();
        Task::leaf("Connect to config repository host", move || async move {
            let keys = shared.keys()?.clone();
            let addr = SocketAddr::new(cfg.service_ips.config_repo.into(), 22);
            let host = retry_with_backoff(&policy, "connect repository host", || {
                connector.connect(addr, &keys)
            })
            .await?;
            host.add_public_key(ADMIN_USER, &cfg.admin_public_key).await?;
            let _ = shared.host.set(host);
            Ok(())
        })
    }

    fn flux(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let charts = self.deps.charts.clone();
        let keys = self.deps.keys.clone();
        let cfg = cfg.clone();
        let shared = shared.clone();
        Task::leaf("Continuous deployment", move || async move {
            let host = shared.host()?;
            let flux_keys = keys.generate(FLUX_USER).await?;
            host.add_user(FLUX_USER, &flux_keys.public).await?;
            host.make_user_admin(FLUX_USER).await?;
            host.add_repository(&cfg.env_name, "# Environment configuration").await?;
            let release = ChartRelease::new(
                "flux-bootstrap",
                "flux",
                &cfg.env_name,
                json!({
                    "image": { "repository": "fluxcd/flux-cli", "tag": "v2.0.0", "pullPolicy": "IfNotPresent" },
                    "repositoryAddress": host.repo_address(&cfg.env_name),
                    "repositoryHost": host.address(),
                    "repositoryHostPublicKey": host.public_key().await?,
                    "privateKey": flux_keys.private,
                    "installationNamespace": format!("{}-flux", cfg.env_name),
                }),
            );
            charts.install(&release).await
        })
    }

    fn init_repo(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let deps = self.deps.clone();
        let cfg = cfg.clone();
        let shared = shared.clone();
        Task::leaf("Initialize config repository", move || async move {
            let host = shared.host()?;
            let keys = shared.keys()?.clone();
            let store = deps.stores.open(&host.repo_address(&cfg.env_name), &keys).await?;
            configure_main_repo(&store, &cfg).await?;
            let manager = AppManager::new(store, deps.namespaces, deps.ports, INFRASTRUCTURE_DIR)?;
            let _ = shared.manager.set(Arc::new(manager));
            Ok(())
        })
    }

    fn infrastructure(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let children = INFRASTRUCTURE_APPS
            .iter()
            .map(|app| {
                let apps = self.deps.apps.clone();
                let namespaces = self.deps.namespaces.clone();
                let cfg = cfg.clone();
                let shared = shared.clone();
                let app = app.to_string();
                Task::leaf(app.clone(), move || async move {
                    let mut values = Values::new();
                    values.insert(
                        "IngressPublicIP".into(),
                        cfg.service_ips.ingress_public.to_string().into(),
                    );
                    let manager = shared.manager()?;
                    install_infra_app(&manager, apps.as_ref(), namespaces.as_ref(), &cfg, &app, &values)
                        .await
                })
            })
            .collect();
        Task::concurrent("Infrastructure services", children)
    }

    fn env_manager(&self, cfg: &Arc<BootstrapConfig>, shared: &Arc<Shared>) -> Task {
        let apps = self.deps.apps.clone();
        let namespaces = self.deps.namespaces.clone();
        let keys = self.deps.keys.clone();
        let cfg = cfg.clone();
        let shared = shared.clone();
        Task::leaf("Environment manager", move || async move {
            let host = shared.host()?;
            let user = format!("{}-env-manager", cfg.env_name);
            let user_keys = keys.generate(&user).await?;
            host.add_user(&user, &user_keys.public).await?;
            host.make_user_admin(&user).await?;
            let mut values = Values::new();
            values.insert("RepoIP".into(), cfg.service_ips.config_repo.to_string().into());
            values.insert("RepoPort".into(), 22.into());
            values.insert("RepoName".into(), cfg.env_name.clone().into());
            values.insert("SSHPrivateKey".into(), user_keys.private.into());
            let manager = shared.manager()?;
            install_infra_app(
                &manager,
                apps.as_ref(),
                namespaces.as_ref(),
                &cfg,
                ENV_MANAGER_APP,
                &values,
            )
            .await
        })
    }

    fn revoke_keys(&self, shared: &Arc<Shared>) -> Task {
        let shared = shared.clone();
        Task::leaf("Revoke bootstrap credentials", move || async move {
            let host = shared.host()?;
            let public = shared.keys()?.public.clone();
            host.remove_public_key(ADMIN_USER, &public).await
        })
    }
}

/// Write the initial layout of an environment's config repository and
/// commit it.
pub async fn configure_main_repo(store: &Store, cfg: &BootstrapConfig) -> Result<()> {
    let env = cfg.env_config();
    let charts_repo = charts_git_repository(&cfg.env_name, &cfg.charts_repo_url);
    let root = Kustomization::with_resources([
        format!("{}-flux", cfg.env_name),
        INFRASTRUCTURE_DIR.to_string(),
        ENVIRONMENTS_DIR.to_string(),
    ]);
    store
        .transact(
            |fs| {
                write_yaml(fs, crate::paths::ENV_CONFIG_FILE, &env)?;
                graph::write_manifest(fs, "", &root)?;
                fs.write(&format!("{INFRASTRUCTURE_DIR}/{CHARTS_REPO_FILE}"), charts_repo.as_bytes())?;
                graph::write_manifest(
                    fs,
                    INFRASTRUCTURE_DIR,
                    &Kustomization::with_resources([CHARTS_REPO_FILE]),
                )?;
                graph::write_manifest(fs, ENVIRONMENTS_DIR, &Kustomization::default())?;
                Ok("initialize config repository structure".into())
            },
            DoOptions::default(),
        )
        .await
}

/// Source definition pointing the deployment controller at the chart
/// repository at `url`.
pub fn charts_git_repository(namespace: &str, url: &str) -> String {
    format!(
        "apiVersion: source.toolkit.fluxcd.io/v1
kind: GitRepository
metadata:
  name: terrace-charts
  namespace: {namespace}
spec:
  interval: 1m0s
  url: {url}
  ref:
    branch: main
"
    )
}

/// Install catalogue app `name` under `infrastructure/<name>`, creating
/// every namespace it declares with the environment prefix.
async fn install_infra_app(
    manager: &AppManager,
    apps: &dyn AppRepository,
    namespaces: &dyn NamespaceCreator,
    cfg: &BootstrapConfig,
    name: &str,
    values: &Values,
) -> Result<()> {
    let def = apps.find(name)?;
    let names = NamespaceNames::prefixed(cfg.namespace_prefix.clone());
    let generated: Vec<String> = def.namespaces.iter().map(|n| names.generate(n)).collect();
    for ns in &generated {
        namespaces.create(ns).await?;
    }
    let release_ns = generated
        .first()
        .cloned()
        .unwrap_or_else(|| names.generate(&def.name));
    let dir = manager.instance_dir(&def.name);
    manager
        .install(&def, &def.name, &dir, &release_ns, values)
        .await?;
    Ok(())
}
