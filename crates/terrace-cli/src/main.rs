mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::app::{InstallArgs, RenderArgs, UpdateArgs};
use cmd::init::InitArgs;
use cmd::Globals;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "terrace",
    about = "GitOps application store: render, install and manage app instances in a config repository",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config repository working tree (default: auto-detect from kustomization.yaml or .git/)
    #[arg(long, global = true, env = "TERRACE_ROOT")]
    root: Option<PathBuf>,

    /// Directory holding app definitions (*.yaml)
    #[arg(long, global = true, env = "TERRACE_APPS_DIR")]
    apps_dir: Option<PathBuf>,

    /// Store directory app instances are installed under
    #[arg(long, global = true, default_value = "apps")]
    app_root: String,

    /// Work on the local tree only: no git pull/push, no cluster calls
    #[arg(long, global = true)]
    offline: bool,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the environment config and the root manifests
    Init(InitArgs),

    /// Render an app without touching the store
    Render(RenderArgs),

    /// Install a new app instance
    Install(InstallArgs),

    /// Re-render an installed instance with new values
    Update(UpdateArgs),

    /// Remove an app instance
    Remove { id: String },

    /// List installed app instances
    List {
        /// Only instances of this app
        #[arg(long)]
        app: Option<String>,
    },

    /// Show one app instance
    Show { id: String },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let globals = Globals {
        root: root::resolve_root(cli.root.as_deref()),
        apps_dir: cli.apps_dir,
        app_root: cli.app_root,
        offline: cli.offline,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Init(args) => cmd::init::run(&globals, args),
        Commands::Render(args) => cmd::app::render(&globals, args),
        Commands::Install(args) => cmd::app::install(&globals, args),
        Commands::Update(args) => cmd::app::update(&globals, args),
        Commands::Remove { id } => cmd::app::remove(&globals, &id),
        Commands::List { app } => cmd::app::list(&globals, app.as_deref()),
        Commands::Show { id } => cmd::app::show(&globals, &id),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
