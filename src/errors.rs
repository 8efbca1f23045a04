//! Error taxonomy shared by the gateway, pool, dispatcher and importer.
//!
//! Per-device and per-send failures are turned into data (modem health, FAILED history
//! records) at the component boundary. Only [`ConfigError`] is fatal, and only at startup.

use thiserror::Error;

/// Failures reported by a [`crate::gateway::DeviceGateway`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Device absent, or the control tool could not talk to it.
    #[error("device {path} unreachable: {reason}")]
    Unreachable { path: String, reason: String },

    /// The external call did not finish inside its bound.
    #[error("{op} on {path} timed out after {seconds}s")]
    Timeout {
        path: String,
        op: &'static str,
        seconds: u64,
    },

    /// A raw control command was rejected or could not be written.
    #[error("activation of {path} failed: {reason}")]
    ActivationFailed { path: String, reason: String },

    /// The device layer refused or failed to submit the message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Another process holds the serial port.
    #[error("device {0} is busy (held by another process)")]
    PortBusy(String),

    /// The external program could not be started at all.
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },
}

impl GatewayError {
    pub fn is_port_busy(&self) -> bool {
        matches!(self, GatewayError::PortBusy(_))
    }
}

/// Configuration problems. Fatal at startup, since a bad configuration cannot be
/// safely applied to physical devices.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Recipient import failures.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The file could not be opened or decoded at all.
    #[error("unreadable CSV {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Conditions that stop a dispatch run before any message is sent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Another active run already owns this modem.
    #[error("modem {0} is already in use by another dispatch run")]
    ModemBusy(String),

    /// No dispatchable modem was available.
    #[error("no healthy modem selected")]
    NoModems,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = GatewayError::Timeout {
            path: "/dev/ttyUSB0".into(),
            op: "identify",
            seconds: 3,
        };
        assert_eq!(err.to_string(), "identify on /dev/ttyUSB0 timed out after 3s");
        assert!(GatewayError::PortBusy("/dev/ttyUSB1".into()).is_port_busy());
        assert!(!GatewayError::SendFailed("x".into()).is_port_busy());
    }
}
