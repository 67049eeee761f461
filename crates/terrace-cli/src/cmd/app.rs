use super::{block_on, parse_values, Globals};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use serde::Serialize;
use terrace_core::app::{AppRepository, InstanceConfig, Release};
use terrace_core::manager::{extract_resources, ResourceRef};
use terrace_core::namespace::NamespaceNames;
use terrace_core::paths;
use terrace_core::store::DoOptions;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct RenderArgs {
    /// App name in the catalogue
    pub app: String,

    /// Instance id to render for (default: <app>-xxx)
    #[arg(long)]
    pub id: Option<String>,

    /// Release namespace (default: environment prefix + app namespace)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Template value as key=value; repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(Args)]
pub struct InstallArgs {
    /// App name in the catalogue
    pub app: String,

    /// Instance id (default: <app>-xxx)
    #[arg(long)]
    pub id: Option<String>,

    /// Release namespace (default: environment prefix + app namespace)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Template value as key=value; repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Instance id
    pub id: String,

    /// App to render (default: the app the instance was installed from)
    #[arg(long)]
    pub app: Option<String>,

    /// Template value as key=value, applied over the stored values; repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Write the working tree without committing
    #[arg(long)]
    pub no_commit: bool,
}

#[derive(Serialize)]
struct InstanceSummary<'a> {
    id: &'a str,
    app: &'a str,
    namespace: &'a str,
    dir: &'a str,
}

impl<'a> From<&'a InstanceConfig> for InstanceSummary<'a> {
    fn from(cfg: &'a InstanceConfig) -> Self {
        Self {
            id: &cfg.id,
            app: &cfg.app_id,
            namespace: &cfg.release.namespace,
            dir: &cfg.release.app_dir,
        }
    }
}

#[derive(Serialize)]
struct Installed<'a> {
    id: &'a str,
    app: &'a str,
    namespace: &'a str,
    resources: &'a [ResourceRef],
}

fn print_resources(resources: &[ResourceRef]) {
    let rows = resources
        .iter()
        .map(|r| vec![r.name.clone(), r.namespace.clone()])
        .collect();
    print_table(&["RESOURCE", "NAMESPACE"], rows);
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

pub fn render(globals: &Globals, args: RenderArgs) -> anyhow::Result<()> {
    let apps = globals.catalogue()?;
    let def = apps.find(&args.app)?;
    let values = parse_values(&args.set)?;
    block_on(async {
        let manager = globals.manager().await?;
        let env = manager.config().context("reading environment config")?;
        let id = args.id.unwrap_or_else(|| paths::generate_instance_id(&def.name));
        let namespace = args
            .namespace
            .unwrap_or_else(|| default_namespace(&env.namespace_prefix, &def));
        let release = Release {
            app_instance_id: id.clone(),
            namespace,
            repo_addr: manager.store().full_address(),
            app_dir: manager.instance_dir(&id),
        };
        let rendered = manager.render(&def, &release, &values)?;
        extract_resources(&rendered.resources)?;

        if globals.json {
            let text = |files: &std::collections::BTreeMap<String, Vec<u8>>| {
                files
                    .iter()
                    .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                    .collect::<std::collections::BTreeMap<_, _>>()
            };
            print_json(&serde_json::json!({
                "config": rendered.config,
                "resources": text(&rendered.resources),
                "data": text(&rendered.data),
                "readme": rendered.readme,
                "ports": rendered.ports,
            }))?;
        } else {
            for (name, contents) in &rendered.resources {
                println!("---\n# {name}");
                print!("{}", String::from_utf8_lossy(contents));
            }
        }
        anyhow::Ok(())
    })?
}

fn default_namespace(prefix: &str, def: &terrace_core::app::AppDefinition) -> String {
    let short = def.namespaces.first().unwrap_or(&def.name);
    NamespaceNames::prefixed(prefix).generate(short)
}

// ---------------------------------------------------------------------------
// install / update / remove
// ---------------------------------------------------------------------------

pub fn install(globals: &Globals, args: InstallArgs) -> anyhow::Result<()> {
    let apps = globals.catalogue()?;
    let def = apps.find(&args.app)?;
    let values = parse_values(&args.set)?;
    let id = args.id.unwrap_or_else(|| paths::generate_instance_id(&def.name));
    block_on(async {
        let manager = globals.manager().await?;
        let namespace = match args.namespace {
            Some(ns) => ns,
            None => {
                let env = manager.config().context("reading environment config")?;
                default_namespace(&env.namespace_prefix, &def)
            }
        };
        let res = manager
            .install_instance(&def, &id, &namespace, &values)
            .await
            .with_context(|| format!("installing {} as {id}", def.name))?;

        if globals.json {
            print_json(&Installed {
                id: &id,
                app: &def.name,
                namespace: &namespace,
                resources: &res.resources,
            })?;
        } else {
            println!("Installed {id} ({}) in namespace {namespace}", def.name);
            print_resources(&res.resources);
        }
        anyhow::Ok(())
    })?
}

pub fn update(globals: &Globals, args: UpdateArgs) -> anyhow::Result<()> {
    let overrides = parse_values(&args.set)?;
    block_on(async {
        let manager = globals.manager().await?;
        manager.store().pull().await;
        let current = manager.find_instance(&args.id)?;
        let app = args.app.unwrap_or_else(|| current.app_id.clone());
        let def = globals.catalogue()?.find(&app)?;
        let mut values = current.input;
        values.extend(overrides);
        let opts = if args.no_commit {
            DoOptions::no_commit()
        } else {
            DoOptions::default()
        };
        let res = manager
            .update(&def, &args.id, &values, opts)
            .await
            .with_context(|| format!("updating {}", args.id))?;

        if globals.json {
            print_json(&Installed {
                id: &args.id,
                app: &def.name,
                namespace: &current.release.namespace,
                resources: &res.resources,
            })?;
        } else {
            println!("Updated {} ({})", args.id, def.name);
            print_resources(&res.resources);
        }
        anyhow::Ok(())
    })?
}

pub fn remove(globals: &Globals, id: &str) -> anyhow::Result<()> {
    block_on(async {
        let manager = globals.manager().await?;
        manager
            .remove(id)
            .await
            .with_context(|| format!("removing {id}"))?;
        if globals.json {
            print_json(&serde_json::json!({ "removed": id }))?;
        } else {
            println!("Removed {id}");
        }
        anyhow::Ok(())
    })?
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

pub fn list(globals: &Globals, app: Option<&str>) -> anyhow::Result<()> {
    block_on(async {
        let manager = globals.manager().await?;
        let instances = match app {
            Some(app) => {
                manager.store().pull().await;
                manager.find_all_app_instances(app)?
            }
            None => manager.find_all_instances().await?,
        };

        if globals.json {
            let out: Vec<InstanceSummary> = instances.iter().map(InstanceSummary::from).collect();
            return print_json(&out);
        }
        if instances.is_empty() {
            println!("No app instances.");
            return Ok(());
        }
        let rows = instances
            .iter()
            .map(|i| {
                vec![
                    i.id.clone(),
                    i.app_id.clone(),
                    i.release.namespace.clone(),
                    i.release.app_dir.clone(),
                ]
            })
            .collect();
        print_table(&["ID", "APP", "NAMESPACE", "DIR"], rows);
        anyhow::Ok(())
    })?
}

pub fn show(globals: &Globals, id: &str) -> anyhow::Result<()> {
    block_on(async {
        let manager = globals.manager().await?;
        manager.store().pull().await;
        let instance = manager.find_instance(id)?;

        if globals.json {
            let mut out = serde_json::to_value(&instance)?;
            if let Some(obj) = out.as_object_mut() {
                obj.insert("id".into(), instance.id.clone().into());
            }
            return print_json(&out);
        }
        println!("id:        {}", instance.id);
        println!("app:       {}", instance.app_id);
        println!("namespace: {}", instance.release.namespace);
        println!("dir:       {}", instance.release.app_dir);
        if !instance.input.is_empty() {
            println!("values:");
            for (k, v) in &instance.input {
                println!("  {k}: {v}");
            }
        }
        anyhow::Ok(())
    })?
}
