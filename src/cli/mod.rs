//! CLI argument definitions for fedtree.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::Tier;

/// fedtree - Assemble and reconcile a tiered tree of federated agents.
///
/// Edit the topology with `fedtree node` and `fedtree edge`, then bring the
/// agents in line with `fedtree sync`.
#[derive(Parser, Debug)]
#[command(name = "fedtree")]
#[command(author, version, about = "Assemble and reconcile a tiered tree of federated agents", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Topology file to operate on (default: ./topology.json).
    /// Can also be set via FEDTREE_TOPOLOGY environment variable.
    #[arg(long, global = true)]
    pub topology: Option<PathBuf>,

    /// Config file (default: ~/.config/fedtree/config.kdl)
    #[arg(long, global = true, env = "FEDTREE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Upper bound on each agent call in seconds (0 waits forever)
    #[arg(long = "call-timeout", global = true, value_name = "SECS")]
    pub call_timeout: Option<u64>,

    /// Log filter, e.g. `debug` or `fedtree=trace` (overrides RUST_LOG)
    #[arg(long = "log-level", global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Node management commands
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Edge management commands (parent -> child links)
    Edge {
        #[command(subcommand)]
        command: EdgeCommands,
    },

    /// Remove every node and edge
    Clear,

    /// Check the topology against the tier rules
    Check,

    /// Write the topology to a file
    Export {
        /// Destination (default: federated_topology_YYYY_MM_DD_HH_MM.json)
        path: Option<PathBuf>,
    },

    /// Replace the topology with the contents of a file
    Import {
        /// Topology file to read
        path: PathBuf,
    },

    /// Initialize every agent that has a label and an address
    Init,

    /// Fetch agent ids from every reachable agent
    Fetch,

    /// Propagate parent or children links to the agents
    Propagate {
        #[command(subcommand)]
        command: PropagateCommands,
    },

    /// Initialize, then propagate parents and children
    Sync,

    /// Detach a node from its parent on the agents
    Detach {
        #[command(subcommand)]
        command: DetachCommands,
    },

    /// Ask an agent about its links
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },

    /// Print status updates pushed by the agents
    Watch {
        /// Stop after this many updates
        #[arg(long)]
        count: Option<usize>,

        /// Stop after this many seconds
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Node subcommands
#[derive(Subcommand, Debug)]
pub enum NodeCommands {
    /// Add a node
    Add {
        /// Tier: root, mid or leaf (cloud, fog and edge also work)
        tier: Tier,

        /// Display label (default depends on the tier)
        #[arg(short, long)]
        label: Option<String>,

        /// Agent address as host:port
        #[arg(short, long)]
        address: Option<String>,

        /// Canvas x position
        #[arg(long, allow_negative_numbers = true)]
        x: Option<f64>,

        /// Canvas y position
        #[arg(long, allow_negative_numbers = true)]
        y: Option<f64>,
    },

    /// Change a node
    Update {
        /// Node ID (e.g., nd-1)
        id: String,

        /// New display label
        #[arg(short, long)]
        label: Option<String>,

        /// New agent address as host:port
        #[arg(short, long)]
        address: Option<String>,

        /// New tier
        #[arg(long)]
        tier: Option<Tier>,

        /// Record an agent id by hand
        #[arg(long, conflicts_with = "clear_agent_id")]
        agent_id: Option<String>,

        /// Forget the recorded agent id
        #[arg(long)]
        clear_agent_id: bool,

        /// Canvas x position
        #[arg(long, allow_negative_numbers = true)]
        x: Option<f64>,

        /// Canvas y position
        #[arg(long, allow_negative_numbers = true)]
        y: Option<f64>,
    },

    /// Remove a node and its edges
    Remove {
        /// Node ID
        id: String,
    },

    /// Show one node
    Show {
        /// Node ID
        id: String,
    },

    /// List nodes
    List {
        /// Only nodes of this tier
        #[arg(long)]
        tier: Option<Tier>,
    },
}

/// Edge subcommands
#[derive(Subcommand, Debug)]
pub enum EdgeCommands {
    /// Link a parent to a child
    Add {
        /// Parent node ID
        parent: String,
        /// Child node ID
        child: String,
    },

    /// Remove the link between a parent and a child
    Remove {
        /// Parent node ID
        parent: String,
        /// Child node ID
        child: String,
    },

    /// List edges
    List,
}

/// Propagation subcommands
#[derive(Subcommand, Debug)]
pub enum PropagateCommands {
    /// Tell each child agent who its parent is
    Parents,
    /// Tell each parent agent the full list of its children
    Children,
}

/// Detach subcommands
#[derive(Subcommand, Debug)]
pub enum DetachCommands {
    /// Tell the node's own agent to drop its parent
    Parent {
        /// Node ID
        node: String,
    },
    /// Tell the node's parent agent to drop the node
    Child {
        /// Node ID
        node: String,
    },
}

/// Query subcommands
#[derive(Subcommand, Debug)]
pub enum QueryCommands {
    /// Ask a node's agent for its parent
    Parent {
        /// Node ID
        node: String,
    },
    /// Ask a node's agent for its children
    Children {
        /// Node ID
        node: String,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved settings and where each came from
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_node_add() {
        let cli = Cli::try_parse_from([
            "fedtree", "-H", "node", "add", "fog", "--label", "fog-a", "--address", "10.0.0.2:9001",
        ])
        .unwrap();
        assert!(cli.human_readable);
        match cli.command {
            Commands::Node {
                command: NodeCommands::Add { tier, label, address, .. },
            } => {
                assert_eq!(tier, Tier::Mid);
                assert_eq!(label.as_deref(), Some("fog-a"));
                assert_eq!(address.as_deref(), Some("10.0.0.2:9001"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_tier() {
        assert!(Cli::try_parse_from(["fedtree", "node", "add", "branch"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "fedtree", "sync", "--topology", "t.json", "--call-timeout", "0",
        ])
        .unwrap();
        assert_eq!(cli.topology, Some(PathBuf::from("t.json")));
        assert_eq!(cli.call_timeout, Some(0));
        assert!(matches!(cli.command, Commands::Sync));
    }
}
