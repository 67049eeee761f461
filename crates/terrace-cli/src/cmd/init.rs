use super::{block_on, Globals};
use crate::output::print_json;
use anyhow::Context;
use clap::Args;
use terrace_core::env::EnvConfig;
use terrace_core::graph;
use terrace_core::paths;
use terrace_core::store::{read_yaml, write_yaml, DoOptions, RepoRead};

#[derive(Args)]
pub struct InitArgs {
    /// Environment id
    #[arg(long)]
    pub id: String,

    /// Public domain of the environment
    #[arg(long)]
    pub domain: String,

    /// Infrastructure the environment runs on (default: the environment id)
    #[arg(long)]
    pub infra_name: Option<String>,

    /// Private domain (default: p.<domain>)
    #[arg(long)]
    pub private_domain: Option<String>,

    #[arg(long)]
    pub contact_email: Option<String>,

    /// Public IP address; repeatable
    #[arg(long = "public-ip")]
    pub public_ip: Vec<String>,
}

impl InitArgs {
    fn env_config(self, existing: Option<EnvConfig>) -> EnvConfig {
        let base = existing.unwrap_or_default();
        EnvConfig {
            infra_name: self.infra_name.unwrap_or_else(|| self.id.clone()),
            private_domain: self
                .private_domain
                .unwrap_or_else(|| format!("p.{}", self.domain)),
            contact_email: self.contact_email.unwrap_or(base.contact_email),
            public_ip: if self.public_ip.is_empty() {
                base.public_ip
            } else {
                self.public_ip
            },
            namespace_prefix: format!("{}-", self.id),
            id: self.id,
            domain: self.domain,
            extra: base.extra,
        }
    }
}

/// Write `config.yaml` and link the app root into the root manifest.
/// Re-running keeps unknown config keys and existing manifest entries.
pub fn run(globals: &Globals, args: InitArgs) -> anyhow::Result<()> {
    for ip in &args.public_ip {
        ip.parse::<std::net::IpAddr>()
            .with_context(|| format!("invalid --public-ip '{ip}'"))?;
    }
    block_on(async {
        let store = globals.open_store().await?;
        store.pull().await;
        let existing = if store.exists(paths::ENV_CONFIG_FILE)? {
            Some(
                read_yaml::<EnvConfig, _>(store.as_ref(), paths::ENV_CONFIG_FILE)
                    .context("reading existing config.yaml")?,
            )
        } else {
            None
        };
        let env = args.env_config(existing);
        let app_root = paths::normalize(&globals.app_root)?;
        store
            .transact(
                |fs| {
                    write_yaml(fs, paths::ENV_CONFIG_FILE, &env)?;
                    graph::ensure_manifest(fs, "")?;
                    if !app_root.is_empty() {
                        fs.create_dir(&app_root)?;
                        graph::ensure_manifest(fs, &app_root)?;
                        graph::link_ancestors(fs, &app_root)?;
                    }
                    Ok(format!("initialize environment {}", env.id))
                },
                DoOptions::default(),
            )
            .await
            .context("writing environment config")?;

        if globals.json {
            print_json(&env)?;
        } else {
            println!("Initialized environment '{}' at {}", env.id, store.root().display());
        }
        anyhow::Ok(())
    })?
}
