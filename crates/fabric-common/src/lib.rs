//! Common infrastructure for the vswitch test fabric.
//!
//! This crate provides the shared pieces every fabric component needs:
//!
//! - [`error`]: Error types for topology and compiler operations
//! - [`types`]: Network value types (MAC address, interface address, VNI)
//! - [`provision`]: The provisioning-sink boundary towards the live switch
//!
//! # Architecture
//!
//! The fabric core is a pure compiler: it maintains an in-memory topology
//! model and turns it into ordered batches of flow rules. Everything that
//! touches a real switch (rule application, topology discovery, telemetry
//! queries) sits behind the boundary traits defined here and is implemented
//! elsewhere.

pub mod error;
pub mod provision;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{FabricError, FabricResult};
pub use provision::{ProvisioningSink, RecordingSink, SinkOp};
pub use types::{InterfaceAddress, MacAddr, Vni};
