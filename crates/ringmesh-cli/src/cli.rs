//! Clap CLI definitions for ringmesh.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  ringmesh registry --port 5000               Run the registry
  ringmesh node --registry 10.0.0.1:5000      Join an overlay as a messaging node

Registry console:  list-messaging-nodes, setup-overlay <n>, list-routing-tables, start <n>, exit
Node console:      print-counters-and-diagnostics, exit-overlay, exit";

/// ringmesh: chord-style ring overlay with traffic experiments.
#[derive(Parser, Debug)]
#[command(name = "ringmesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ./ringmesh.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the registry.
    Registry {
        /// Port to listen on (overrides registry.listen_addr).
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },
    /// Run a messaging node.
    Node {
        /// Registry address as host:port (overrides node.registry_addr).
        #[arg(long, short = 'r')]
        registry: Option<String>,
        /// Address for the peer listener (overrides node.listen_addr).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}
