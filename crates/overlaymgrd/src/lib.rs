//! overlaymgrd - overlay pipeline manager for the vswitch test fabric.
//!
//! Owns the topology model (bridges, interfaces, uplinks, tunnel ports) and
//! compiles it into the multi-table match-action pipeline of a software
//! switch: VNI resolution at INPUT, a conntrack ACL stage, a learning-bridge
//! CORE/FIB pair, a NAT/ALG chain and flooding/unicast delivery at OUTPUT.
//! Compiled rules leave through the provisioning sink as wire-format
//! strings; nothing in this crate touches a data path.

pub mod acl;
pub mod backend;
pub mod config;
pub mod conntrack;
pub mod nat;
pub mod overlay_mgr;
pub mod pipeline;
pub mod rule;
pub mod tables;
pub mod topology;

pub use overlay_mgr::OverlayMgr;
pub use topology::{Bridge, DeployMode, Topology};
