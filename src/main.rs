// Sylva CLI - scenario service for forest inventory simulations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sylva::api::{self, AppState};
use sylva::catalog::{models_from_yaml, register_inventory};
use sylva::config::AppConfig;
use sylva::remote::{RemoteLayout, ScpTransfer, SessionManager, SshConnector};
use sylva::scenario::{ScenarioCompiler, ScenarioService, StatusPoller, Step};
use sylva::store::{DocumentStore, JsonStore, LocalStorage};

#[derive(Parser)]
#[command(
    name = "sylva",
    about = "Forest inventory scenarios on a remote batch cluster",
    version,
    disable_colored_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run the HTTP API and the status poller
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Print the cluster's batch queue as JSON
    Queue,

    /// Render a job configuration without storing anything
    Render {
        /// JSON file holding the step list
        #[arg(long)]
        steps: PathBuf,

        /// Stored inventory file name the job reads
        #[arg(long)]
        inventory_file: String,

        #[arg(long)]
        scenario_id: String,

        /// Projection model for the first operation
        #[arg(long)]
        model_path: String,

        #[arg(long)]
        model_class: String,
    },

    /// Manage inventories
    Inventory {
        #[command(subcommand)]
        action: InventoryAction,
    },

    /// Manage the model catalog
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum InventoryAction {
    /// Register a workbook, or a plot CSV followed by a tree CSV
    Add {
        /// Display name
        #[arg(long)]
        name: String,

        /// Owner user id
        #[arg(long)]
        owner: String,

        /// Visible to every user
        #[arg(long)]
        public: bool,

        #[arg(required = true, num_args = 1..=2)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum ModelAction {
    /// Load catalog entries from a YAML list
    Import {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "sylva=debug" } else { "sylva=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match load_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Serve { bind } => serve(config, bind).await,
            Commands::Queue => print_queue(config).await,
            Commands::Render {
                steps,
                inventory_file,
                scenario_id,
                model_path,
                model_class,
            } => render(config, &steps, &inventory_file, &scenario_id, &model_path, &model_class),
            Commands::Inventory { action } => handle_inventory_command(config, action).await,
            Commands::Model { action } => handle_model_command(config, action).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => Ok(AppConfig::load(path)?),
        None => Ok(AppConfig::from_env()),
    }
}

fn session_manager(config: &AppConfig) -> SessionManager {
    SessionManager::new(
        Arc::new(SshConnector::new(&config.remote)),
        Arc::new(ScpTransfer::new(&config.remote)),
        RemoteLayout::from_config(&config.remote),
    )
    .with_max_waiters(config.remote.max_waiters)
    .with_wait_timeout(config.remote.wait_timeout())
}

fn open_store(config: &AppConfig) -> anyhow::Result<(Arc<JsonStore>, LocalStorage)> {
    let storage = LocalStorage::new(&config.storage.root);
    storage.ensure()?;
    let store = JsonStore::open(&config.storage.store_file())?;
    Ok((Arc::new(store), storage))
}

async fn serve(mut config: AppConfig, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let (store, storage) = open_store(&config)?;
    let session = Arc::new(session_manager(&config));
    let compiler = ScenarioCompiler::new(RemoteLayout::from_config(&config.remote))?;
    let service = Arc::new(ScenarioService::new(
        store.clone(),
        session.clone(),
        compiler,
        storage.clone(),
    ));

    let shutdown = install_shutdown_handler();

    let poller = StatusPoller::new(store, session.clone(), storage, config.poller.interval());
    let poller_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    let app = api::router(AppState { scenarios: service }, &config.server.base_path);

    let served = api::serve(listener, app, shutdown.clone()).await;

    // The poller finishes its current tick before exiting
    shutdown.cancel();
    if let Err(e) = poller_task.await {
        tracing::error!(error = %e, "status poller task failed");
    }
    session.shutdown();

    served.context("HTTP server failed")
}

/// Cancel the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        trigger.cancel();
    });

    token
}

async fn print_queue(config: AppConfig) -> anyhow::Result<()> {
    let session = session_manager(&config);
    let entries = session.list_queue().await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    session.shutdown();
    Ok(())
}

fn render(
    config: AppConfig,
    steps_file: &Path,
    inventory_file: &str,
    scenario_id: &str,
    model_path: &str,
    model_class: &str,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(steps_file)
        .with_context(|| format!("failed to read {}", steps_file.display()))?;
    let mut steps: Vec<Step> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON step list", steps_file.display()))?;
    for step in &mut steps {
        step.coerce_variables();
    }

    let compiler = ScenarioCompiler::new(RemoteLayout::from_config(&config.remote))?;
    let document = compiler.compile(scenario_id, &steps, inventory_file, model_path, model_class)?;
    println!("{}", document);
    Ok(())
}

async fn handle_inventory_command(config: AppConfig, action: InventoryAction) -> anyhow::Result<()> {
    match action {
        InventoryAction::Add {
            name,
            owner,
            public,
            files,
        } => {
            let (store, storage) = open_store(&config)?;
            let inventory =
                register_inventory(&name, &files, &owner, public, &storage.inventory_dir())?;
            let inventory = store.insert_inventory(inventory).await?;
            println!("{}", serde_json::to_string_pretty(&inventory)?);
            Ok(())
        }
    }
}

async fn handle_model_command(config: AppConfig, action: ModelAction) -> anyhow::Result<()> {
    match action {
        ModelAction::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let models = models_from_yaml(&content)?;

            let (store, _) = open_store(&config)?;
            for model in models {
                let model = store.insert_model(model).await?;
                println!("{}\t{}", model.id, model.name);
            }
            Ok(())
        }
    }
}
