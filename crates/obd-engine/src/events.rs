//! Engine event stream
//!
//! State changes, adapter traffic and connection milestones are broadcast on
//! one channel so a host can drive a traffic monitor or persist the last
//! connected device without polling.

use obd_detect::ConnectStrategy;

use crate::state::{ConnectionState, LinkQuality, NegotiatedProtocol};

/// Engine activity
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The supervisor moved to a new state
    StateChanged(ConnectionState),

    /// Command text written to the adapter (engine -> adapter)
    DataOut { text: String },

    /// Raw response frame read from the adapter (adapter -> engine)
    DataIn { text: String },

    /// A connection reached ready
    Connected {
        device_id: String,
        display_name: String,
        strategy: ConnectStrategy,
        protocol: NegotiatedProtocol,
        adapter_version: Option<String>,
    },

    /// An established connection ended
    Disconnected {
        device_id: String,
        reason: Option<String>,
    },

    /// Result of one health probe
    HealthProbe {
        latency_ms: u64,
        quality: LinkQuality,
        ok: bool,
    },

    /// A recovered or reported failure
    Error { source: String, message: String },
}

impl LinkEvent {
    pub fn is_traffic(&self) -> bool {
        matches!(self, LinkEvent::DataOut { .. } | LinkEvent::DataIn { .. })
    }

    pub fn is_state_change(&self) -> bool {
        matches!(self, LinkEvent::StateChanged(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LinkEvent::Error { .. })
    }
}
