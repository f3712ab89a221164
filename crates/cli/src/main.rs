use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use noco_config::AgentConfig;
use noco_host_modules::{ChrootRunner, HostContext};
use noco_node_agent::{Agent, Deletion, DirStore, Driver, DriverSettings, ObjectStore, Outcome, StaticNodes};
use noco_nodeconfig::{admit, NodeConfig, ObjectKey};

#[derive(Parser)]
#[command(name = "noco", version, about = "Per-node configuration agent")]
struct Cli {
    /// Log as JSON lines instead of text
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop until Ctrl-C
    Agent {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run one reconciliation pass for one object on this node
    Reconcile {
        #[arg(long)]
        config: PathBuf,
        /// Object as <namespace>/<name>
        object: ObjectKey,
    },
    /// Check an object against spec rules and the stored objects
    Validate {
        #[arg(long)]
        store: PathBuf,
        /// NodeConfig JSON file
        file: PathBuf,
    },
    /// Validate and store an object
    Apply {
        #[arg(long)]
        store: PathBuf,
        /// NodeConfig JSON file
        file: PathBuf,
    },
    /// Delete an object; it stays until every node released it
    Delete {
        #[arg(long)]
        store: PathBuf,
        object: ObjectKey,
    },
    /// Print node outcomes and conditions of an object
    Status {
        #[arg(long)]
        store: PathBuf,
        object: ObjectKey,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_object(path: &Path) -> anyhow::Result<NodeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn build_driver(config: &AgentConfig) -> Driver {
    let runner = Arc::new(ChrootRunner::new(&config.host_root));
    let host = HostContext::new(&config.host_root, runner)
        .with_host_fs(config.host_fs_enabled)
        .with_package_management(config.package_management_enabled);
    let store = Arc::new(DirStore::new(&config.store.path));
    let nodes = Arc::new(StaticNodes::from_config(&config.nodes));
    Driver::new(DriverSettings::from_config(config), host, store, nodes)
}

/// Rejection message, or `None` if the object is admitted.
async fn check(store: &DirStore, object: &NodeConfig) -> anyhow::Result<Option<String>> {
    let existing = store.list().await?;
    Ok(admit(object, &existing).err().map(|e| e.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Agent { config } => {
            let config = AgentConfig::load(&config)?;
            let agent = Agent::new(Arc::new(build_driver(&config)));
            agent
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            info!("agent stopped");
        }
        Commands::Reconcile { config, object } => {
            let config = AgentConfig::load(&config)?;
            let driver = build_driver(&config);
            let result = driver.reconcile(&object).await?;

            return Ok(match result.outcome {
                Outcome::Error(message) => {
                    println!("{}: Error: {}", object, message);
                    ExitCode::FAILURE
                }
                Outcome::NotReady => {
                    println!("{}: node {} is not ready", object, config.node_name);
                    ExitCode::FAILURE
                }
                outcome => {
                    println!("{}: {:?}", object, outcome);
                    ExitCode::SUCCESS
                }
            });
        }
        Commands::Validate { store, file } => {
            let object = read_object(&file)?;
            match check(&DirStore::new(store), &object).await? {
                Some(reason) => {
                    println!("rejected: {}", reason);
                    return Ok(ExitCode::FAILURE);
                }
                None => println!("{} admitted", object.key()),
            }
        }
        Commands::Apply { store, file } => {
            let store = DirStore::new(store);
            let object = read_object(&file)?;
            if let Some(reason) = check(&store, &object).await? {
                println!("rejected: {}", reason);
                return Ok(ExitCode::FAILURE);
            }
            let stored = store.apply(object).await?;
            println!("{} applied (generation {})", stored.key(), stored.metadata.generation);
        }
        Commands::Delete { store, object } => {
            match DirStore::new(store).delete(&object).await? {
                Deletion::Removed => println!("{} deleted", object),
                Deletion::Pending => println!("{} marked for deletion", object),
            }
        }
        Commands::Status { store, object } => {
            let stored = DirStore::new(store)
                .get(&object)
                .await?
                .ok_or_else(|| anyhow::anyhow!("{} not found", object))?;

            println!("{} (generation {})", object, stored.metadata.generation);
            if stored.status.nodes.is_empty() {
                println!("No node has reported yet.");
            }
            for (node, outcome) in &stored.status.nodes {
                let state = format!("{:?}", outcome.status);
                print!("  {:<20} {:<10} generation {}", node, state, outcome.last_generation);
                if !outcome.error.is_empty() {
                    print!("  {}", outcome.error);
                }
                println!();
            }
            for condition in &stored.status.conditions {
                println!("  {:<10} {:<5} {}", condition.kind.to_string(), condition.status, condition.reason);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
