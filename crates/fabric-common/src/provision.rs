//! Provisioning boundary between the compiler core and the live switch.
//!
//! The core never talks to a switch itself: it hands ordered batches of
//! wire-format rule strings to a [`ProvisioningSink`]. Success or failure is
//! reported per batch, not per rule. Transient-failure handling belongs to
//! sink implementations and their callers, never to the compiler.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::error::FabricResult;

/// One operation recorded against a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    /// A batch of rules applied to a bridge.
    Apply {
        /// Target bridge name.
        bridge: String,
        /// Wire-format rule strings, in provisioning order.
        flows: Vec<String>,
    },
    /// A "clear previous rules" directive for a set of tables.
    Clear {
        /// Target bridge name.
        bridge: String,
        /// Table ids to clear; empty means the whole flow table.
        tables: Vec<u8>,
    },
}

/// Accepts compiled flow rules for a named bridge.
#[async_trait]
pub trait ProvisioningSink: Send + Sync {
    /// Applies an ordered batch of wire-format rules to a bridge.
    async fn apply_flows(&self, bridge: &str, flows: &[String]) -> FabricResult<()>;

    /// Clears previously provisioned rules from the given tables of a
    /// bridge. An empty table list clears every table.
    async fn clear_flows(&self, bridge: &str, tables: &[u8]) -> FabricResult<()>;
}

/// A sink that records every operation instead of touching a switch.
///
/// Used by tests and by the rule-preview tooling.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    ops: Arc<Mutex<Vec<SinkOp>>>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded operation, in order.
    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().expect("sink poisoned").clone()
    }

    /// Returns every rule string applied so far, in provisioning order.
    pub fn applied_flows(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Apply { flows, .. } => Some(flows),
                SinkOp::Clear { .. } => None,
            })
            .flatten()
            .collect()
    }
}

#[async_trait]
impl ProvisioningSink for RecordingSink {
    async fn apply_flows(&self, bridge: &str, flows: &[String]) -> FabricResult<()> {
        tracing::debug!(bridge = %bridge, count = flows.len(), "Recording flow batch");
        self.ops.lock().expect("sink poisoned").push(SinkOp::Apply {
            bridge: bridge.to_string(),
            flows: flows.to_vec(),
        });
        Ok(())
    }

    async fn clear_flows(&self, bridge: &str, tables: &[u8]) -> FabricResult<()> {
        self.ops.lock().expect("sink poisoned").push(SinkOp::Clear {
            bridge: bridge.to_string(),
            tables: tables.to_vec(),
        });
        Ok(())
    }
}
