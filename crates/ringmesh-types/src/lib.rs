//! Core types for the ringmesh overlay.
//!
//! This crate defines the identifiers and configuration shared by the wire
//! protocol, the registry and the messaging nodes. It contains no networking.

pub mod config;
pub mod node_id;

pub use config::{
    load_config, read_config, resolve_config, ConfigError, NodeConfig, RegistryConfig, RingConfig,
};
pub use node_id::{NodeId, NodeIdError, FAILURE_SENTINEL};
