//! Setup of an environment on an already bootstrapped cluster.
//!
//! ```text
//! Set up environment <id>                 sequential
//!   DNS zone records for <domain>         sequential
//!     Configure DNS
//!     Propagate DNS records               wait
//!   Configure environment infrastructure
//!   Create client                         refresh the config working copy
//!   Core services                         concurrent
//!     Setup network                       private address pools + proxy
//!     Configure TLS certificate issuers   sequential
//!       Public <domain>
//!       Private p.<domain>
//!     Authentication services             install + wait
//!     VPN coordinator                     install + wait
//!     Welcome service                     install + wait
//!     Application marketplace
//! ```

use super::{dns_propagated, https_reachable, wait_for, Resolver, Task};
use crate::app::{AppRepository, Values};
use crate::bootstrap::{charts_git_repository, KeyGenerator, RepoHost, CHARTS_REPO_FILE};
use crate::env::EnvConfig;
use crate::error::Result;
use crate::graph;
use crate::manager::AppManager;
use crate::namespace::NamespaceNames;
use crate::paths;
use crate::store::{write_yaml, DoOptions};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DNS_ZONE_FILE: &str = "dns-zone.yaml";
pub const CONFIG_REPO: &str = "config";

/// Private network of an environment. The first address belongs to the
/// private ingress, the next one to the VPN coordinator.
pub const PRIVATE_SUBNET: &str = "10.1.0.0/24";
pub const INGRESS_PRIVATE_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
pub const HEADSCALE_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
const PRIVATE_POOL: (Ipv4Addr, Ipv4Addr) = (Ipv4Addr::new(10, 1, 0, 100), Ipv4Addr::new(10, 1, 0, 254));

/// Inputs shared by every environment setup task.
#[derive(Clone)]
pub struct EnvSetup {
    pub env: EnvConfig,
    pub public_ips: Vec<IpAddr>,
    pub manager: Arc<AppManager>,
    pub apps: Arc<dyn AppRepository>,
    pub host: Arc<dyn RepoHost>,
    pub keys: Arc<dyn KeyGenerator>,
    pub resolver: Arc<dyn Resolver>,
    pub http: reqwest::Client,
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
    pub charts_repo_url: String,
}

impl EnvSetup {
    fn namespaces(&self) -> NamespaceNames {
        NamespaceNames::prefixed(format!("{}-", self.env.id))
    }

    fn wait_https(&self, url: String) -> Task {
        wait_for(
            format!("Wait for {url}"),
            self.poll_interval,
            self.cancel.clone(),
            https_reachable(self.http.clone(), url),
        )
    }
}

/// The environment setup tree.
pub fn setup_environment(setup: EnvSetup) -> Task {
    Task::sequential(
        format!("Set up environment {}", setup.env.id),
        vec![
            dns_zone(&setup),
            commit_env_config(&setup),
            create_client(&setup),
            Task::concurrent(
                "Core services",
                vec![
                    setup_network(&setup),
                    certificate_issuers(&setup),
                    Task::sequential(
                        "Authentication services",
                        vec![
                            install_leaf(&setup, "Setup", "core-auth", values([("Subdomain", "test")])),
                            setup.wait_https(format!("https://accounts-ui.{}", setup.env.domain)),
                        ],
                    ),
                    Task::sequential(
                        "VPN coordinator",
                        vec![
                            install_leaf(&setup, "Setup", "headscale", values([("Subdomain", "headscale")])),
                            setup.wait_https(format!("https://headscale.{}/apple", setup.env.domain)),
                        ],
                    ),
                    Task::sequential(
                        "Welcome service",
                        vec![
                            repo_user_install(&setup, "Setup", "welcome", format!("{}-welcome", setup.env.id)),
                            setup.wait_https(format!("https://welcome.{}", setup.env.domain)),
                        ],
                    ),
                    repo_user_install(
                        &setup,
                        "Application marketplace",
                        "app-manager",
                        format!("{}-appmanager", setup.env.id),
                    ),
                ],
            ),
        ],
    )
}

fn values<const N: usize>(pairs: [(&str, &str); N]) -> Values {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

fn object(value: serde_json::Value) -> Values {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Values::new(),
    }
}

fn dns_zone(setup: &EnvSetup) -> Task {
    let domain = setup.env.domain.clone();
    let write = {
        let manager = setup.manager.clone();
        let zone = dns_zone_manifest(&setup.env.id, &domain, &setup.public_ips);
        Task::leaf("Configure DNS", move || async move {
            manager
                .store()
                .transact(
                    |fs| {
                        fs.write(DNS_ZONE_FILE, zone.as_bytes())?;
                        graph::add_resource(fs, "", DNS_ZONE_FILE)?;
                        Ok("configure dns zone".into())
                    },
                    DoOptions::default(),
                )
                .await
        })
    };
    let propagate = wait_for(
        "Propagate DNS records",
        setup.poll_interval,
        setup.cancel.clone(),
        dns_propagated(setup.resolver.clone(), domain.clone(), setup.public_ips.clone()),
    );
    Task::sequential(format!("DNS zone records for {domain}"), vec![write, propagate])
}

/// Zone resource consumed by the in-cluster DNS controller.
pub fn dns_zone_manifest(namespace: &str, zone: &str, public_ips: &[IpAddr]) -> String {
    let ips: String = public_ips.iter().map(|ip| format!("  - {ip}\n")).collect();
    format!(
        "apiVersion: dns.terrace.dev/v1
kind: DNSZone
metadata:
  name: dns-zone
  namespace: {namespace}
spec:
  zone: {zone}
  privateIP: {INGRESS_PRIVATE_IP}
  publicIPs:
{ips}  nameservers:
{ips}"
    )
}

fn commit_env_config(setup: &EnvSetup) -> Task {
    let manager = setup.manager.clone();
    let mut env = setup.env.clone();
    if env.private_domain.is_empty() {
        env.private_domain = format!("p.{}", env.domain);
    }
    if env.namespace_prefix.is_empty() {
        env.namespace_prefix = format!("{}-", env.id);
    }
    if env.public_ip.is_empty() {
        env.public_ip = setup.public_ips.iter().map(ToString::to_string).collect();
    }
    let charts_repo_url = setup.charts_repo_url.clone();
    Task::leaf("Configure environment infrastructure", move || async move {
        let charts = charts_git_repository(&env.id, &charts_repo_url);
        manager
            .store()
            .transact(
                |fs| {
                    write_yaml(fs, paths::ENV_CONFIG_FILE, &env)?;
                    fs.write(CHARTS_REPO_FILE, charts.as_bytes())?;
                    graph::add_resource(fs, "", CHARTS_REPO_FILE)?;
                    Ok("configure charts repo".into())
                },
                DoOptions::default(),
            )
            .await
    })
}

/// Bring the config working copy up to date before the core services are
/// installed on top of it.
fn create_client(setup: &EnvSetup) -> Task {
    let manager = setup.manager.clone();
    Task::leaf("Create client", move || async move {
        let outcome = manager.store().pull().await;
        info!(repo = %manager.store().full_address(), ?outcome, "config repository ready");
        Ok(())
    })
}

/// Address pools for the private ingress and the VPN coordinator, the pool
/// private services draw from, and the proxy joining the private network.
fn setup_network(setup: &EnvSetup) -> Task {
    let manager = setup.manager.clone();
    let apps = setup.apps.clone();
    let names = setup.namespaces();
    let env_id = setup.env.id.clone();
    Task::leaf("Setup network", move || async move {
        let pool = |name: String, from: Ipv4Addr, to: Ipv4Addr| {
            object(json!({
                "Name": name,
                "From": from.to_string(),
                "To": to.to_string(),
                "AutoAssign": false,
                "Namespace": "metallb-system",
            }))
        };
        let pools = [
            (
                names.with_suffix("-ingress-private"),
                pool(format!("{env_id}-ingress-private"), INGRESS_PRIVATE_IP, INGRESS_PRIVATE_IP),
            ),
            (
                names.with_suffix("-headscale"),
                pool(format!("{env_id}-headscale"), HEADSCALE_IP, HEADSCALE_IP),
            ),
            (names.clone(), pool(env_id.clone(), PRIVATE_POOL.0, PRIVATE_POOL.1)),
        ];
        for (pool_names, values) in &pools {
            install_from_catalogue(&manager, apps.as_ref(), pool_names, "metallb-ipaddresspool", values)
                .await?;
        }
        let proxy = object(json!({
            "PrivateNetwork": {
                "Hostname": "private-network-proxy",
                "Username": "private-network-proxy",
                "IPSubnet": PRIVATE_SUBNET,
            },
        }));
        install_from_catalogue(&manager, apps.as_ref(), &names, "private-network", &proxy).await
    })
}

/// Public issuer first, then the private one backed by the DNS zone
/// manager of the infrastructure.
fn certificate_issuers(setup: &EnvSetup) -> Task {
    let public = install_leaf(
        setup,
        &format!("Public {}", setup.env.domain),
        "certificate-issuer-public",
        Values::new(),
    );
    let private = install_leaf(
        setup,
        &format!("Private p.{}", setup.env.domain),
        "certificate-issuer-private",
        object(json!({
            "APIConfigMap": {
                "Name": "api-config",
                "Namespace": format!("{}-dns-zone-manager", setup.env.infra_name),
            },
        })),
    );
    Task::sequential("Configure TLS certificate issuers", vec![public, private])
}

/// Install `app` from the catalogue under a generated instance id.
async fn install_from_catalogue(
    manager: &AppManager,
    apps: &dyn AppRepository,
    names: &NamespaceNames,
    app: &str,
    values: &Values,
) -> Result<()> {
    let def = apps.find(app)?;
    let short = def.namespaces.first().cloned().unwrap_or_else(|| def.name.clone());
    let namespace = names.generate(&short);
    let id = paths::generate_instance_id(&def.name);
    manager.install_instance(&def, &id, &namespace, values).await?;
    info!(app, instance = %id, namespace = %namespace, "installed core service");
    Ok(())
}

fn install_leaf(setup: &EnvSetup, name: &str, app: &'static str, values: Values) -> Task {
    let manager = setup.manager.clone();
    let apps = setup.apps.clone();
    let names = setup.namespaces();
    Task::leaf(name, move || async move {
        install_from_catalogue(&manager, apps.as_ref(), &names, app, &values).await
    })
}

/// Create a repository user with read-write access to the config repo and
/// install `app` with its credentials.
fn repo_user_install(setup: &EnvSetup, name: &str, app: &'static str, user: String) -> Task {
    let manager = setup.manager.clone();
    let apps = setup.apps.clone();
    let host = setup.host.clone();
    let keys = setup.keys.clone();
    let names = setup.namespaces();
    Task::leaf(name, move || async move {
        let pair = keys.generate(&user).await?;
        host.add_user(&user, &pair.public).await?;
        host.add_read_write_collaborator(CONFIG_REPO, &user).await?;
        let mut values = Values::new();
        values.insert("RepoAddr".into(), host.repo_address(CONFIG_REPO).into());
        values.insert("SSHPrivateKey".into(), pair.private.into());
        install_from_catalogue(&manager, apps.as_ref(), &names, app, &values).await
    })
}
