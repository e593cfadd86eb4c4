//! Error types for fabric operations.
//!
//! Configuration errors reflect static setup mistakes and are always fatal;
//! they are never retried. Parse errors surface malformed switch telemetry
//! and are the only recoverable kind. Transient failures belong to the
//! external provisioning/query sinks, not to this core.

use thiserror::Error;

/// Result type alias for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors that can occur while maintaining the topology model or compiling
/// flow rules.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Static configuration mistake (e.g. a VNI with no local ports).
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The entity that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Deployment mode string is not one of native/tunnel/vlan/qinq.
    #[error("Unsupported deployment mode '{mode}'")]
    UnsupportedMode {
        /// The offending mode string.
        mode: String,
    },

    /// A port-id pool has no free ids left.
    #[error("Port id pool '{pool}' exhausted")]
    PoolExhausted {
        /// The pool name.
        pool: String,
    },

    /// Bridge lookup by name failed.
    #[error("Bridge '{bridge}' not found")]
    BridgeNotFound {
        /// The bridge name.
        bridge: String,
    },

    /// Malformed input text (connection dump, address, MAC).
    #[error("Parse error: {message}")]
    Parse {
        /// What went wrong, including offending input where useful.
        message: String,
    },

    /// Provisioning sink rejected a batch.
    #[error("Provisioning failed on bridge '{bridge}': {message}")]
    Provision {
        /// The target bridge.
        bridge: String,
        /// Error message from the sink.
        message: String,
    },
}

impl FabricError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a pool exhaustion error.
    pub fn pool_exhausted(pool: impl Into<String>) -> Self {
        Self::PoolExhausted { pool: pool.into() }
    }

    /// Creates a bridge lookup error.
    pub fn bridge_not_found(bridge: impl Into<String>) -> Self {
        Self::BridgeNotFound {
            bridge: bridge.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a provisioning error.
    pub fn provision(bridge: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            bridge: bridge.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error reflects a static setup mistake that
    /// retrying cannot fix. Parse errors are recoverable: the caller may
    /// re-query the switch and parse again.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FabricError::Parse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FabricError::pool_exhausted("br0 vif");
        assert_eq!(err.to_string(), "Port id pool 'br0 vif' exhausted");

        let err = FabricError::invalid_config("vni 200", "no local ports");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for vni 200: no local ports"
        );
    }

    #[test]
    fn test_unsupported_mode_display() {
        let err = FabricError::UnsupportedMode {
            mode: "gre".to_string(),
        };
        assert_eq!(err.to_string(), "Unsupported deployment mode 'gre'");
    }

    #[test]
    fn test_is_fatal() {
        assert!(FabricError::pool_exhausted("p").is_fatal());
        assert!(FabricError::invalid_config("f", "m").is_fatal());
        assert!(FabricError::bridge_not_found("br0").is_fatal());
        assert!(!FabricError::parse("nest termination").is_fatal());
    }
}
