//! Random id assignment over a bounded id space.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringmesh_types::NodeId;

/// Hands out ids from `0..space`.
///
/// Up to `retry_limit` uniformly random draws are tried first. If all of them
/// collide, the space is scanned from a random offset, so `None` means every
/// id is in use.
#[derive(Debug)]
pub struct IdAllocator {
    space: u32,
    retry_limit: u32,
    rng: StdRng,
}

impl IdAllocator {
    pub fn new(space: u32, retry_limit: u32) -> Self {
        Self::with_rng(space, retry_limit, StdRng::from_entropy())
    }

    /// Deterministic allocator for tests.
    pub fn with_seed(space: u32, retry_limit: u32, seed: u64) -> Self {
        Self::with_rng(space, retry_limit, StdRng::seed_from_u64(seed))
    }

    fn with_rng(space: u32, retry_limit: u32, rng: StdRng) -> Self {
        Self {
            space,
            retry_limit,
            rng,
        }
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    /// Pick an id for which `taken` is false.
    pub fn allocate<F>(&mut self, taken: F) -> Option<NodeId>
    where
        F: Fn(NodeId) -> bool,
    {
        if self.space == 0 {
            return None;
        }
        for _ in 0..self.retry_limit {
            let id = NodeId(self.rng.gen_range(0..self.space));
            if !taken(id) {
                return Some(id);
            }
        }
        let offset = self.rng.gen_range(0..self.space);
        (0..self.space)
            .map(|i| NodeId((offset + i) % self.space))
            .find(|id| !taken(*id))
    }
}
