//! fedtree CLI - Assemble and reconcile a tiered tree of federated agents.

use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use fedtree::cli::{
    Cli, Commands, ConfigCommands, DetachCommands, EdgeCommands, NodeCommands, PropagateCommands,
    QueryCommands,
};
use fedtree::commands::{self, NodeChanges, Output};
use fedtree::config::{self, ConfigOverrides};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log filter used when neither `--log-level` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "fedtree=warn";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    init_tracing(cli.log_level.as_deref(), cli.log_json);

    if let Err(e) = run(cli) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

/// Install the tracing subscriber. Logs go to stderr so stdout stays
/// machine-readable.
fn init_tracing(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Run an agent-facing command to completion.
fn block_on<F: Future>(future: F) -> Result<F::Output, fedtree::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

/// Turn an unsuccessful reconciliation report into a non-zero exit.
fn require_success(success: bool, what: &str) -> Result<(), fedtree::Error> {
    if success {
        Ok(())
    } else {
        Err(fedtree::Error::Other(format!(
            "{} did not complete on every agent",
            what
        )))
    }
}

fn run(cli: Cli) -> Result<(), fedtree::Error> {
    let human = cli.human_readable;

    let mut overrides = ConfigOverrides::new();
    if let Some(path) = cli.topology {
        overrides = overrides.with_topology(path);
    }
    if let Some(secs) = cli.call_timeout {
        overrides = overrides.with_call_timeout_secs(secs);
    }
    let config_file: Option<PathBuf> = cli.config.clone().or_else(config::system_config_path);
    let settings = config::load(cli.config.as_deref(), &overrides)?;
    let topology = settings.topology_path().clone();

    match cli.command {
        Commands::Node { command } => match command {
            NodeCommands::Add {
                tier,
                label,
                address,
                x,
                y,
            } => {
                let result = commands::node_add(&topology, tier, label, address, x, y)?;
                output(&result, human);
            }
            NodeCommands::Update {
                id,
                label,
                address,
                tier,
                agent_id,
                clear_agent_id,
                x,
                y,
            } => {
                let changes = NodeChanges {
                    label,
                    address,
                    tier,
                    agent_id,
                    clear_agent_id,
                    x,
                    y,
                };
                let result = commands::node_update(&topology, &id, changes)?;
                output(&result, human);
            }
            NodeCommands::Remove { id } => {
                let result = commands::node_remove(&topology, &id)?;
                output(&result, human);
            }
            NodeCommands::Show { id } => {
                let result = commands::node_show(&topology, &id)?;
                output(&result, human);
            }
            NodeCommands::List { tier } => {
                let result = commands::node_list(&topology, tier)?;
                output(&result, human);
            }
        },

        Commands::Edge { command } => match command {
            EdgeCommands::Add { parent, child } => {
                let result = commands::edge_add(&topology, &parent, &child)?;
                output(&result, human);
            }
            EdgeCommands::Remove { parent, child } => {
                let result = commands::edge_remove(&topology, &parent, &child)?;
                output(&result, human);
            }
            EdgeCommands::List => {
                let result = commands::edge_list(&topology)?;
                output(&result, human);
            }
        },

        Commands::Clear => {
            let result = commands::clear(&topology)?;
            output(&result, human);
        }

        Commands::Check => {
            let result = commands::check(&topology)?;
            output(&result, human);
            if !result.is_valid() {
                return Err(fedtree::Error::InvalidInput(format!(
                    "topology has {} shape violation(s)",
                    result.violations.len()
                )));
            }
        }

        Commands::Export { path } => {
            let result = commands::export(&topology, path)?;
            output(&result, human);
        }

        Commands::Import { path } => {
            let result = commands::import(&topology, &path)?;
            output(&result, human);
        }

        Commands::Init => {
            let result = block_on(commands::init(&settings))??;
            output(&result, human);
            require_success(result.success, "initialize")?;
        }

        Commands::Fetch => {
            let result = block_on(commands::fetch(&settings))??;
            output(&result, human);
            require_success(result.success, "get_node_info")?;
        }

        Commands::Propagate { command } => {
            let result = match command {
                PropagateCommands::Parents => {
                    block_on(commands::propagate_parents(&settings))??
                }
                PropagateCommands::Children => {
                    block_on(commands::propagate_children(&settings))??
                }
            };
            output(&result, human);
            require_success(result.success, result.operation.as_str())?;
        }

        Commands::Sync => {
            let result = block_on(commands::sync(&settings))??;
            output(&result, human);
            require_success(result.success, "sync")?;
        }

        Commands::Detach { command } => {
            let result = match command {
                DetachCommands::Parent { node } => {
                    block_on(commands::detach_parent(&settings, &node))??
                }
                DetachCommands::Child { node } => {
                    block_on(commands::detach_child(&settings, &node))??
                }
            };
            output(&result, human);
        }

        Commands::Query { command } => match command {
            QueryCommands::Parent { node } => {
                let result = block_on(commands::query_parent(&settings, &node))??;
                output(&result, human);
            }
            QueryCommands::Children { node } => {
                let result = block_on(commands::query_children(&settings, &node))??;
                output(&result, human);
            }
        },

        Commands::Watch {
            count,
            timeout_secs,
        } => {
            let timeout = timeout_secs.map(Duration::from_secs);
            let received = block_on(commands::watch(&settings, count, timeout, |event| {
                output(event, human)
            }))??;
            tracing::info!(received, "watch finished");
        }

        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let result = commands::config_show(config_file, &settings);
                output(&result, human);
            }
        },
    }

    Ok(())
}

/// Print output in JSON or human-readable format.
fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
