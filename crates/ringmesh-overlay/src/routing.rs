//! Chord-style next-hop resolution.
//!
//! A [`RoutingTable`] holds a node's fingers (finger `i` is the member `2^i`
//! positions ahead of the node on the sorted ring) and a copy of the full
//! ring. Resolution never inspects a packet's hop trace.

use crate::error::RoutingError;
use ringmesh_types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    self_id: NodeId,
    /// Indexed by hop exponent.
    fingers: Vec<NodeId>,
    ring: Vec<NodeId>,
}

impl RoutingTable {
    /// Build a table from the fingers pushed by the registry.
    pub fn new(
        self_id: NodeId,
        fingers: Vec<NodeId>,
        mut ring: Vec<NodeId>,
    ) -> Result<Self, RoutingError> {
        if fingers.is_empty() {
            return Err(RoutingError::NoFingers(self_id));
        }
        if ring.is_empty() {
            return Err(RoutingError::EmptyRing(self_id));
        }
        ring.sort_unstable();
        ring.dedup();
        Ok(Self {
            self_id,
            fingers,
            ring,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn fingers(&self) -> &[NodeId] {
        &self.fingers
    }

    /// Every member id, sorted.
    pub fn ring(&self) -> &[NodeId] {
        &self.ring
    }

    /// Member ids other than this node.
    pub fn others(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.self_id;
        self.ring.iter().copied().filter(move |id| *id != me)
    }

    /// Resolve the neighbour a packet for `target` is forwarded to.
    pub fn next_hop(&self, target: NodeId) -> Result<NodeId, RoutingError> {
        let max = self
            .fingers
            .iter()
            .copied()
            .max()
            .ok_or(RoutingError::NoFingers(self.self_id))?;

        if self.fingers.contains(&target) {
            return Ok(target);
        }

        if target > max {
            return Ok(max);
        }

        if target < self.self_id {
            // Wrapping backward: the highest finger still short of the target.
            let hop = self.fingers.iter().rev().copied().find(|f| *f < target);
            return Ok(hop.unwrap_or(max));
        }

        let bracket = self
            .fingers
            .windows(2)
            .find(|pair| pair[0] < target && target < pair[1])
            .map(|pair| pair[0]);
        Ok(bracket.unwrap_or(max))
    }
}
