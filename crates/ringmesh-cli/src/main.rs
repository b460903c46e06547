//! ringmesh CLI: runs the registry or a messaging node with an operator console.

mod cli;
mod console;

use clap::Parser;
use cli::{Cli, Commands};
use ringmesh_overlay::{MessagingNode, Registry};
use ringmesh_types::{read_config, resolve_config, RingConfig};
use tracing::{debug, error};

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let loaded = read_config(cli.config.as_deref());
    let log_level = match &loaded {
        Ok(Some(config)) => config.log_level.as_str(),
        _ => "info",
    };
    init_tracing_stderr(log_level);
    let mut config = resolve_config(cli.config.as_deref(), loaded);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }
    apply_overrides(&mut config, &cli.command);
    debug!(?config, "Effective configuration");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        match cli.command {
            Commands::Registry { .. } => {
                let registry = Registry::start(config.registry).await?;
                println!("Registry listening on {}", registry.local_addr());
                console::run_registry(registry).await?;
            }
            Commands::Node { .. } => {
                let node = MessagingNode::start(&config.node).await?;
                println!("Messaging node listening on {}", node.listen_addr());
                console::run_node(node).await?;
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    });

    if let Err(e) = result {
        error!(error = %e, "Exiting");
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut RingConfig, command: &Commands) {
    match command {
        Commands::Registry { port } => {
            if let Some(port) = port {
                config.registry.listen_addr.set_port(*port);
            }
        }
        Commands::Node { registry, listen } => {
            if let Some(registry) = registry {
                config.node.registry_addr = registry.clone();
            }
            if let Some(listen) = listen {
                config.node.listen_addr = *listen;
            }
        }
    }
}
