//! Overlay error types.

use ringmesh_types::{ConfigError, NodeId};
use ringmesh_wire::WireError;
use thiserror::Error;
use tracing::error;

/// A routing table that cannot produce a next hop.
///
/// Either case means the topology the node received is structurally broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Routing table of node {0} has no fingers")]
    NoFingers(NodeId),
    #[error("Ring snapshot of node {0} is empty")]
    EmptyRing(NodeId),
}

/// Errors from registry and messaging-node operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// A wrapped transport or codec error.
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A task round was requested before any overlay was built.
    #[error("Overlay has not been set up")]
    OverlayNotBuilt,

    #[error("Finger count must be between 1 and {max}, got {requested}")]
    InvalidFingerCount { requested: u8, max: u8 },

    #[error("Overlay needs at least {needed} members, have {have}")]
    TooFewMembers { needed: usize, have: usize },

    #[error("Node is not registered")]
    NotRegistered,

    #[error("No connection to the registry")]
    RegistryUnavailable,

    #[error("Invalid node id on the wire: {0}")]
    BadNodeId(i32),
}

/// Alias for overlay results.
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Terminate the process on an unrecoverable topology error.
pub fn fatal(err: &RoutingError) -> ! {
    error!(error = %err, "Routing failure, aborting");
    std::process::abort()
}
