//! Connection state model

use std::fmt;
use std::time::Duration;

use obd_detect::Device;
use obd_protocol::ObdProtocol;
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;

/// Protocol chosen for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedProtocol {
    /// `ATSP`/`ATDPN` code
    pub code: u8,
    pub display_name: String,
    /// Found through the adapter's own search rather than set explicitly
    pub automatic: bool,
}

impl NegotiatedProtocol {
    pub fn explicit(protocol: ObdProtocol) -> Self {
        Self {
            code: protocol.code(),
            display_name: protocol.name().to_string(),
            automatic: false,
        }
    }

    pub fn automatic(resolved: ObdProtocol) -> Self {
        Self {
            code: resolved.code(),
            display_name: resolved.name().to_string(),
            automatic: true,
        }
    }

    pub fn protocol(&self) -> Option<ObdProtocol> {
        ObdProtocol::from_code(self.code)
    }
}

impl fmt::Display for NegotiatedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.automatic {
            write!(f, "auto, {} ({})", self.code, self.display_name)
        } else {
            write!(f, "{} ({})", self.code, self.display_name)
        }
    }
}

/// Qualitative link quality from health-probe round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkQuality {
    Excellent,
    Good,
    Fair,
    /// The probe failed
    Poor,
}

impl LinkQuality {
    pub fn from_latency(latency: Duration, config: &HealthConfig) -> Self {
        let ms = latency.as_millis() as u64;
        if ms < config.excellent_below_ms {
            LinkQuality::Excellent
        } else if ms < config.good_below_ms {
            LinkQuality::Good
        } else {
            LinkQuality::Fair
        }
    }
}

/// Supervisor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting {
        device: Device,
        strategy_index: usize,
        attempt: u32,
    },
    Negotiating {
        device: Device,
    },
    Ready {
        device: Device,
        protocol: NegotiatedProtocol,
    },
    Degraded {
        device: Device,
        protocol: NegotiatedProtocol,
        reason: String,
        quality: LinkQuality,
    },
    Disconnected {
        reason: Option<String>,
    },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Negotiating { .. } => "negotiating",
            ConnectionState::Ready { .. } => "ready",
            ConnectionState::Degraded { .. } => "degraded",
            ConnectionState::Disconnected { .. } => "disconnected",
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            ConnectionState::Connecting { device, .. }
            | ConnectionState::Negotiating { device }
            | ConnectionState::Ready { device, .. }
            | ConnectionState::Degraded { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Option<&NegotiatedProtocol> {
        match self {
            ConnectionState::Ready { protocol, .. } | ConnectionState::Degraded { protocol, .. } => {
                Some(protocol)
            }
            _ => None,
        }
    }

    /// Commands are accepted only in these states
    pub fn accepts_commands(&self) -> bool {
        matches!(
            self,
            ConnectionState::Ready { .. } | ConnectionState::Degraded { .. }
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { .. })
    }

    /// Legal transitions
    ///
    /// `Ready` is only reachable from `Negotiating` (or by recovering from
    /// `Degraded`), and `Disconnected` is reachable from anywhere.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected { .. }) => true,
            (Idle | Disconnected { .. }, Scanning) => true,
            (Scanning, Idle) => true,
            (Idle | Disconnected { .. } | Connecting { .. }, Connecting { .. }) => true,
            (Connecting { .. }, Negotiating { .. }) => true,
            (Negotiating { .. } | Degraded { .. }, Ready { .. }) => true,
            (Ready { .. } | Degraded { .. }, Degraded { .. }) => true,
            _ => false,
        }
    }
}
