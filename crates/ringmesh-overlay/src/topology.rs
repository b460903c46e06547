//! Overlay construction.
//!
//! [`Topology::build`] is a pure function of the member set and the finger
//! count: member ids are sorted into a ring and finger `i` of the member at
//! ring position `p` is the member at position `(p + 2^i) mod n`.

use crate::error::{OverlayError, OverlayResult, RoutingError};
use crate::routing::RoutingTable;
use ringmesh_types::NodeId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    ring: Vec<NodeId>,
    finger_count: u8,
    fingers: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Topology {
    /// Compute every member's fingers.
    ///
    /// Rejects a finger count of zero and fewer than two members. Fingers that
    /// wrap a full lap land on the node itself or repeat an earlier finger;
    /// they are kept so every row has `finger_count` entries.
    pub fn build<I>(ids: I, finger_count: u8) -> OverlayResult<Self>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut ring: Vec<NodeId> = ids.into_iter().collect();
        ring.sort_unstable();
        ring.dedup();
        let n = ring.len();

        if n < 2 {
            return Err(OverlayError::TooFewMembers { needed: 2, have: n });
        }
        if finger_count == 0 {
            return Err(OverlayError::InvalidFingerCount {
                requested: 0,
                max: u8::MAX,
            });
        }

        // 2^i mod n, doubled per exponent so large counts cannot overflow.
        let steps: Vec<usize> = (0..finger_count)
            .scan(1 % n, |step, _| {
                let current = *step;
                *step = (*step * 2) % n;
                Some(current)
            })
            .collect();

        let fingers = ring
            .iter()
            .enumerate()
            .map(|(pos, id)| {
                let row = steps.iter().map(|step| ring[(pos + step) % n]).collect();
                (*id, row)
            })
            .collect();

        Ok(Self {
            ring,
            finger_count,
            fingers,
        })
    }

    /// Sorted member ids.
    pub fn ring(&self) -> &[NodeId] {
        &self.ring
    }

    pub fn finger_count(&self) -> u8 {
        self.finger_count
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Fingers of one member, indexed by hop exponent.
    pub fn fingers_of(&self, id: NodeId) -> Option<&[NodeId]> {
        self.fingers.get(&id).map(Vec::as_slice)
    }

    /// Every member with its fingers, in ring order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[NodeId])> + '_ {
        self.fingers.iter().map(|(id, f)| (*id, f.as_slice()))
    }

    /// The routing table a member builds from its manifest.
    pub fn routing_table(&self, id: NodeId) -> Result<RoutingTable, RoutingError> {
        let fingers = self
            .fingers_of(id)
            .ok_or(RoutingError::NoFingers(id))?
            .to_vec();
        RoutingTable::new(id, fingers, self.ring.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    #[test]
    fn test_finger_rule() {
        let topo = Topology::build(ids(&[31, 3, 15, 7]), 2).unwrap();
        assert_eq!(topo.ring(), ids(&[3, 7, 15, 31]).as_slice());
        assert_eq!(topo.fingers_of(NodeId(3)).unwrap(), ids(&[7, 15]).as_slice());
        assert_eq!(topo.fingers_of(NodeId(15)).unwrap(), ids(&[31, 3]).as_slice());
        assert_eq!(topo.fingers_of(NodeId(31)).unwrap(), ids(&[3, 7]).as_slice());
        assert!(topo.fingers_of(NodeId(4)).is_none());
    }

    #[test]
    fn test_rejects_degenerate_overlays() {
        assert!(matches!(
            Topology::build(ids(&[1]), 1),
            Err(OverlayError::TooFewMembers { have: 1, .. })
        ));
        assert!(matches!(
            Topology::build(ids(&[1, 2, 3]), 0),
            Err(OverlayError::InvalidFingerCount { requested: 0, .. })
        ));
    }

    #[test]
    fn test_wrapped_fingers_are_kept() {
        // 2^2 = 4 laps a four-member ring: the third finger is the node itself.
        let topo = Topology::build(ids(&[1, 2, 3, 4]), 3).unwrap();
        assert_eq!(topo.fingers_of(NodeId(1)).unwrap(), ids(&[2, 3, 1]).as_slice());
        assert_eq!(topo.fingers_of(NodeId(4)).unwrap(), ids(&[1, 2, 4]).as_slice());

        let wide = Topology::build(ids(&[1, 2, 3, 4]), 200).unwrap();
        assert_eq!(wide.fingers_of(NodeId(2)).unwrap().len(), 200);
    }

    #[test]
    fn test_ten_members_five_fingers_route() {
        let ring = ids(&[2, 9, 14, 21, 30, 38, 45, 51, 60, 77]);
        let topo = Topology::build(ring.clone(), 5).unwrap();
        // Finger 4 is 16 positions ahead, six after one lap.
        assert_eq!(topo.fingers_of(NodeId(2)).unwrap()[4], NodeId(45));
        let tables = tables(&topo);
        for &src in &ring {
            for &dst in &ring {
                if src != dst {
                    assert!(route(&tables, src, dst).is_ok(), "{src} -> {dst}");
                }
            }
        }
    }

    #[test]
    fn test_build_is_order_independent() {
        let a = Topology::build(ids(&[9, 1, 40, 22, 17]), 3).unwrap();
        let b = Topology::build(ids(&[40, 17, 22, 1, 9, 9]), 3).unwrap();
        assert_eq!(a, b);
    }

    fn tables(topo: &Topology) -> BTreeMap<NodeId, RoutingTable> {
        topo.ring()
            .iter()
            .map(|id| (*id, topo.routing_table(*id).unwrap()))
            .collect()
    }

    /// Follow next hops from `src` until `dst` is reached.
    fn route(
        tables: &BTreeMap<NodeId, RoutingTable>,
        src: NodeId,
        dst: NodeId,
    ) -> Result<usize, String> {
        let n = tables.len();
        let mut at = src;
        let mut hops = 0;
        while at != dst {
            let next = tables[&at].next_hop(dst).map_err(|e| e.to_string())?;
            if next == at {
                return Err(format!("{at} routes {dst} to itself"));
            }
            at = next;
            hops += 1;
            if hops > n {
                return Err(format!("{src} -> {dst} did not arrive in {n} hops"));
            }
        }
        Ok(hops)
    }

    fn ring_and_fingers() -> impl Strategy<Value = (Vec<NodeId>, u8)> {
        (proptest::collection::btree_set(0u32..256, 2..=96), 1u8..=5)
            .prop_map(|(set, fc)| (set.into_iter().map(NodeId).collect(), fc))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_every_route_arrives((ring, fc) in ring_and_fingers()) {
            let topo = Topology::build(ring.clone(), fc).unwrap();
            let tables = tables(&topo);
            for &src in &ring {
                for &dst in &ring {
                    if src != dst {
                        let result = route(&tables, src, dst);
                        prop_assert!(result.is_ok(), "{:?}", result);
                    }
                }
            }
        }

        #[test]
        fn prop_build_is_deterministic((ring, fc) in ring_and_fingers()) {
            let mut shuffled = ring.clone();
            shuffled.reverse();
            let a = Topology::build(ring, fc).unwrap();
            let b = Topology::build(shuffled, fc).unwrap();
            prop_assert_eq!(&a, &b);
            for (_, fingers) in a.iter() {
                prop_assert_eq!(fingers.len(), usize::from(fc));
            }
        }
    }
}
