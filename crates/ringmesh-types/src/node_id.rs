//! Overlay member identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status id carried by failed registration/deregistration replies.
pub const FAILURE_SENTINEL: i32 = -1;

/// Identifier of a registered overlay member.
///
/// Ids are small integers drawn from the registry's bounded id space and are
/// recycled after deregistration. On the wire they travel as `int32`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A wire integer that cannot name a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid node id: {0}")]
pub struct NodeIdError(pub i32);

impl NodeId {
    /// The raw wire representation.
    pub fn as_wire(self) -> i32 {
        // Ids are bounded by the registry's id space (at most 256).
        self.0 as i32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for NodeId {
    type Error = NodeIdError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        u32::try_from(raw).map(NodeId).map_err(|_| NodeIdError(raw))
    }
}

impl From<NodeId> for i32 {
    fn from(id: NodeId) -> Self {
        id.as_wire()
    }
}
