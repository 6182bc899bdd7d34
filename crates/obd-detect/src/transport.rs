//! The Transport capability
//!
//! The engine never touches radio or serial hardware itself. A host hands it
//! a [`Transport`] that can list devices, optionally run discovery, and open
//! a byte channel to one device. The channel is a plain async byte stream:
//! writing a command is a write, the adapter's answers are reads, closing is
//! shutting down and dropping the stream, and a read returning EOF (or an
//! I/O error) is the disconnection notification.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// A device as reported by the transport, before scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Transport-specific identifier (MAC address, port path, ...)
    pub id: String,
    /// Advertised name; many adapters advertise none
    pub display_name: Option<String>,
    /// RSSI in dBm when known
    pub signal_strength: Option<i16>,
    pub already_paired: bool,
}

impl RawDevice {
    pub fn paired(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: Some(name.into()),
            signal_strength: None,
            already_paired: true,
        }
    }

    pub fn discovered(id: impl Into<String>, name: Option<&str>, signal_strength: Option<i16>) -> Self {
        Self {
            id: id.into(),
            display_name: name.map(str::to_string),
            signal_strength,
            already_paired: false,
        }
    }

    /// Name with surrounding whitespace removed, `None` when blank
    pub fn name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}

/// One way of opening a channel to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectStrategy {
    /// Unauthenticated channel (no pairing handshake)
    Insecure,
    /// Authenticated channel (requires or performs pairing)
    Secure,
    /// Direct channel selection, bypassing service lookup
    DirectChannel,
}

impl ConnectStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectStrategy::Insecure => "insecure",
            ConnectStrategy::Secure => "secure",
            ConnectStrategy::DirectChannel => "direct channel",
        }
    }
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Notifications emitted while discovery runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(RawDevice),
    Error(String),
}

/// Byte channel to an adapter
pub trait AdapterIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AdapterIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed channel returned by [`Transport::open`]
pub type AdapterStream = Box<dyn AdapterIo>;

/// Platform-specific access to adapters
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Devices the host already knows (paired or otherwise directly reachable)
    async fn list_available_devices(&self) -> Result<Vec<RawDevice>, TransportError>;

    /// Whether [`begin_discovery`](Self::begin_discovery) is available
    fn supports_discovery(&self) -> bool {
        false
    }

    /// Start discovery; events arrive on the returned channel until
    /// [`end_discovery`](Self::end_discovery) is called or the sender is dropped
    async fn begin_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        Err(TransportError::DiscoveryUnsupported)
    }

    async fn end_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Open a channel to `device_id` using `strategy`
    async fn open(
        &self,
        device_id: &str,
        strategy: ConnectStrategy,
    ) -> Result<AdapterStream, TransportError>;
}
