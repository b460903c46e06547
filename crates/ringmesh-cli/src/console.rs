//! Operator consoles for the registry and messaging nodes.
//!
//! Each console reads one command per line from stdin and maps it directly
//! onto a registry or node operation.

use ringmesh_overlay::{MessagingNode, Registry, RegistryEvent};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub const REGISTRY_COMMANDS: &str = "Known commands are:\n\
    \tlist-messaging-nodes\n\
    \tsetup-overlay <number-of-routing-table-entries>\n\
    \tlist-routing-tables\n\
    \tstart <number-of-messages>\n\
    \texit";

pub const NODE_COMMANDS: &str = "Known commands are:\n\
    \tprint-counters-and-diagnostics\n\
    \texit-overlay\n\
    \texit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryCommand {
    ListMessagingNodes,
    SetupOverlay(u8),
    ListRoutingTables,
    Start(i32),
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    PrintCountersAndDiagnostics,
    ExitOverlay,
    Exit,
}

fn argument<T: FromStr>(command: &str, arg: Option<&str>) -> Result<T, String> {
    let raw = arg.ok_or_else(|| format!("{command} needs a number"))?;
    raw.parse()
        .map_err(|_| format!("{command}: '{raw}' is not a valid number"))
}

impl FromStr for RegistryCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let arg = words.next();
        match command {
            "list-messaging-nodes" => Ok(Self::ListMessagingNodes),
            "setup-overlay" => argument(command, arg).map(Self::SetupOverlay),
            "list-routing-tables" => Ok(Self::ListRoutingTables),
            "start" => match argument::<i32>(command, arg)? {
                n if n > 0 => Ok(Self::Start(n)),
                n => Err(format!("start: message count must be positive, got {n}")),
            },
            "exit" => Ok(Self::Exit),
            _ => Err(format!("Unknown command. {REGISTRY_COMMANDS}")),
        }
    }
}

impl FromStr for NodeCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim() {
            "print-counters-and-diagnostics" => Ok(Self::PrintCountersAndDiagnostics),
            "exit-overlay" => Ok(Self::ExitOverlay),
            "exit" => Ok(Self::Exit),
            _ => Err(format!("Unknown command. {NODE_COMMANDS}")),
        }
    }
}

/// Run the registry console until `exit` or end of input.
pub async fn run_registry(registry: Arc<Registry>) -> std::io::Result<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::OverlayReady { failed: 0, .. }) => {
                    println!("Registry is ready to initiate tasks.");
                }
                Ok(RegistryEvent::OverlayReady { members, failed }) => {
                    println!(
                        "Registry is ready to initiate tasks ({failed} of {members} nodes failed setup)."
                    );
                }
                Ok(RegistryEvent::SetupFailed { reason }) => {
                    println!("Overlay setup failed: {reason}");
                }
                Ok(RegistryEvent::TrafficReport(report)) => println!("{report}"),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Console fell behind events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<RegistryCommand>() {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match command {
            RegistryCommand::ListMessagingNodes => {
                let members = registry.members();
                if members.is_empty() {
                    println!("No messaging nodes registered.");
                }
                for member in members {
                    println!("{member}");
                }
            }
            RegistryCommand::SetupOverlay(count) => {
                if let Err(e) = registry.generate_overlay(count).await {
                    println!("Cannot set up overlay: {e}");
                }
            }
            RegistryCommand::ListRoutingTables => match registry.topology() {
                Some(topology) => {
                    for (id, fingers) in topology.iter() {
                        println!("Node {id}:");
                        for (i, finger) in fingers.iter().enumerate() {
                            println!("\t{} hop(s) away: {finger}", 1u64 << i);
                        }
                    }
                }
                None => println!("Overlay has not been set up."),
            },
            RegistryCommand::Start(count) => {
                if let Err(e) = registry.initiate_task(count).await {
                    println!("Cannot start task: {e}");
                }
            }
            RegistryCommand::Exit => break,
        }
    }
    registry.shutdown();
    Ok(())
}

/// Run the node console until `exit` or end of input.
pub async fn run_node(node: Arc<MessagingNode>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<NodeCommand>() {
            Ok(NodeCommand::PrintCountersAndDiagnostics) => print_diagnostics(&node),
            Ok(NodeCommand::ExitOverlay) => {
                if let Err(e) = node.deregister().await {
                    println!("Cannot leave overlay: {e}");
                }
            }
            Ok(NodeCommand::Exit) => break,
            Err(message) => println!("{message}"),
        }
    }
    node.shutdown();
    Ok(())
}

fn print_diagnostics(node: &MessagingNode) {
    match node.id() {
        Some(id) => println!("Node {id} listening on {}", node.listen_addr()),
        None => println!("Not registered; listening on {}", node.listen_addr()),
    }
    let counters = node.counters();
    println!("Messages sent: {}", counters.sent);
    println!("Messages received: {}", counters.received);
    println!("Messages relayed: {}", counters.relayed);
    println!("Sent summation: {}", counters.sum_sent);
    println!("Receive summation: {}", counters.sum_received);
    println!("Pending relays: {}", node.pending_relays());
    if let Some(table) = node.routing_table() {
        for (i, finger) in table.fingers().iter().enumerate() {
            println!("\t{} hop(s) away: {finger}", 1u64 << i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_commands() {
        assert_eq!(
            "list-messaging-nodes".parse(),
            Ok(RegistryCommand::ListMessagingNodes)
        );
        assert_eq!(
            "setup-overlay 3".parse(),
            Ok(RegistryCommand::SetupOverlay(3))
        );
        assert_eq!("  start   500 ".parse(), Ok(RegistryCommand::Start(500)));
        assert_eq!("exit".parse(), Ok(RegistryCommand::Exit));
    }

    #[test]
    fn test_registry_command_errors() {
        assert!("setup-overlay".parse::<RegistryCommand>().is_err());
        assert!("setup-overlay many".parse::<RegistryCommand>().is_err());
        assert!("start 0".parse::<RegistryCommand>().is_err());
        let unknown = "frobnicate".parse::<RegistryCommand>().unwrap_err();
        assert!(unknown.contains("list-routing-tables"));
    }

    #[test]
    fn test_node_commands() {
        assert_eq!(
            "print-counters-and-diagnostics".parse(),
            Ok(NodeCommand::PrintCountersAndDiagnostics)
        );
        assert_eq!("exit-overlay\n".parse(), Ok(NodeCommand::ExitOverlay));
        let unknown = "start 5".parse::<NodeCommand>().unwrap_err();
        assert!(unknown.contains("exit-overlay"));
    }
}
