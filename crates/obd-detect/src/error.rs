//! Error types for transports and discovery

use thiserror::Error;

use crate::transport::ConnectStrategy;

/// Errors reported by a [`Transport`](crate::Transport)
#[derive(Debug, Error)]
pub enum TransportError {
    /// No usable transport on this host (radio off, no permission, no ports)
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Failed to list known devices
    #[error("failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    /// Discovery could not be started or aborted midway
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The transport has no active discovery
    #[error("discovery is not supported by this transport")]
    DiscoveryUnsupported,

    /// Device id is not known to the transport
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// Opening a channel with a particular strategy failed
    #[error("failed to open {device} ({strategy}): {reason}")]
    OpenFailed {
        device: String,
        strategy: ConnectStrategy,
        reason: String,
    },

    /// I/O error on an open channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}
