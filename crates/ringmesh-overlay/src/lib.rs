//! ringmesh overlay: registry, messaging nodes and chord-style routing.
//!
//! The [`Registry`] admits nodes, assigns ids, builds the [`Topology`] and
//! coordinates setup, task and summary rounds. Each [`MessagingNode`] installs
//! the fingers it is sent, generates random traffic and relays packets
//! through its [`RoutingTable`].

pub mod addr;
pub mod error;
pub mod id_pool;
pub mod node;
pub mod registry;
pub mod routing;
pub mod stats;
pub mod topology;
pub mod traffic;

pub use error::{fatal, OverlayError, OverlayResult, RoutingError};
pub use id_pool::IdAllocator;
pub use node::{MessagingNode, NodeEvent};
pub use registry::{MemberInfo, Registry, RegistryEvent};
pub use routing::RoutingTable;
pub use stats::{StatisticsCollector, TrafficReport, TrafficRow};
pub use topology::Topology;
pub use traffic::{RelayQueue, TrafficCounters};
