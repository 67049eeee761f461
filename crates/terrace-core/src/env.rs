//! Environment-wide configuration.
//!
//! [`EnvConfig`] is stored at the root of the config store and handed to
//! every template render as `global`. [`BootstrapConfig`] carries the
//! parameters needed to bring up a fresh cluster.

use crate::error::{Result, TerraceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

// ---------------------------------------------------------------------------
// EnvConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvConfig {
    /// Environment id, also used as a namespace and ingress-class prefix.
    pub id: String,
    /// Name of the infrastructure this environment runs on.
    #[serde(default)]
    pub infra_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub private_domain: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default, rename = "publicIP")]
    pub public_ip: Vec<String>,
    #[serde(default)]
    pub namespace_prefix: String,
    /// Keys this crate does not interpret; passed through to templates.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub ingress_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_issuer: Option<String>,
    pub domain: String,
    pub allocate_port_addr: String,
}

/// Public and private ingress networks of an environment.
pub fn networks(env: &EnvConfig) -> Vec<Network> {
    vec![
        Network {
            name: "Public".into(),
            ingress_class: format!("{}-ingress-public", env.infra_name),
            certificate_issuer: Some(format!("{}-public", env.id)),
            domain: env.domain.clone(),
            allocate_port_addr: format!(
                "http://port-allocator.{}-ingress-public.svc.cluster.local/api/allocate",
                env.infra_name
            ),
        },
        Network {
            name: "Private".into(),
            ingress_class: format!("{}-ingress-private", env.id),
            certificate_issuer: None,
            domain: env.private_domain.clone(),
            allocate_port_addr: format!(
                "http://port-allocator.{}-ingress-private.svc.cluster.local/api/allocate",
                env.id
            ),
        },
    ]
}

// ---------------------------------------------------------------------------
// Bootstrap parameters
// ---------------------------------------------------------------------------

/// Addresses handed out to load-balanced services during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIps {
    pub config_repo: Ipv4Addr,
    pub ingress_public: Ipv4Addr,
    /// General pool, inclusive.
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
}

impl ServiceIps {
    /// Split `from..=to`: the first address serves the config repo, the
    /// second the public ingress, and the rest form the general pool.
    pub fn from_range(from: Ipv4Addr, to: Ipv4Addr) -> Result<Self> {
        let start = u32::from(from);
        let end = u32::from(to);
        if end < start.saturating_add(2) {
            return Err(TerraceError::Validation(format!(
                "service ip range {from}-{to} needs at least 3 addresses"
            )));
        }
        Ok(Self {
            config_repo: from,
            ingress_public: Ipv4Addr::from(start + 1),
            from: Ipv4Addr::from(start + 2),
            to,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub env_name: String,
    pub public_ip: Vec<IpAddr>,
    pub namespace_prefix: String,
    pub storage_dir: String,
    pub volume_default_replica_count: u32,
    /// Operator key granted admin access on the config repository host.
    pub admin_public_key: String,
    pub service_ips: ServiceIps,
    #[serde(default = "default_charts_repo_url")]
    pub charts_repo_url: String,
}

pub const DEFAULT_CHARTS_REPO_URL: &str = "https://github.com/terrace-dev/charts";

fn default_charts_repo_url() -> String {
    DEFAULT_CHARTS_REPO_URL.to_string()
}

impl BootstrapConfig {
    pub fn new(env_name: impl Into<String>, service_ips: ServiceIps) -> Self {
        let env_name = env_name.into();
        Self {
            namespace_prefix: format!("{env_name}-"),
            env_name,
            public_ip: Vec::new(),
            storage_dir: "/terrace-storage/longhorn".into(),
            volume_default_replica_count: 1,
            admin_public_key: String::new(),
            service_ips,
            charts_repo_url: default_charts_repo_url(),
        }
    }

    /// Environment config written to a freshly bootstrapped config repo.
    pub fn env_config(&self) -> EnvConfig {
        let mut extra = BTreeMap::new();
        extra.insert(
            "storageDir".to_string(),
            serde_yaml::Value::from(self.storage_dir.clone()),
        );
        extra.insert(
            "ingressPublicIP".to_string(),
            serde_yaml::Value::from(self.service_ips.ingress_public.to_string()),
        );
        EnvConfig {
            id: self.env_name.clone(),
            infra_name: self.env_name.clone(),
            public_ip: self.public_ip.iter().map(ToString::to_string).collect(),
            namespace_prefix: self.namespace_prefix.clone(),
            extra,
            ..Default::default()
        }
    }
}

/// Parse a comma separated list of addresses.
pub fn parse_ips(list: &str) -> Result<Vec<IpAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| TerraceError::Validation(format!("invalid ip: {s}")))
        })
        .collect()
}
