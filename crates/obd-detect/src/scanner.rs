//! Device scanner
//!
//! Merges the transport's already-known devices with a time-boxed discovery
//! window, filters out devices that are unlikely to be adapters, and ranks
//! the rest by compatibility score.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::scoring::{self, AdapterKind};
use crate::transport::{DiscoveryEvent, RawDevice, Transport};

/// A ranked candidate adapter, re-created on every scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub is_paired: bool,
    pub signal_strength: Option<i16>,
    pub kind_guess: AdapterKind,
    /// 0..=100
    pub compatibility_score: u8,
}

impl Device {
    pub fn from_raw(raw: &RawDevice) -> Self {
        Self {
            id: raw.id.clone(),
            display_name: scoring::display_name(raw),
            is_paired: raw.already_paired,
            signal_strength: raw.signal_strength,
            kind_guess: scoring::guess_kind(raw),
            compatibility_score: scoring::compatibility_score(raw),
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Discovery window used when the caller does not pass one
    pub discovery_window_ms: u64,
    /// Offer devices that advertise no name
    pub include_unnamed: bool,
    /// Drop unpaired devices scoring below this
    pub min_score: u8,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            discovery_window_ms: 12_000,
            include_unnamed: true,
            min_score: 0,
        }
    }
}

impl ScannerConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}

/// Collects raw devices by id, preserving first-seen order
#[derive(Default)]
struct DeviceSet {
    order: Vec<String>,
    by_id: HashMap<String, RawDevice>,
}

impl DeviceSet {
    fn merge(&mut self, device: RawDevice) {
        match self.by_id.get_mut(&device.id) {
            Some(existing) if existing.already_paired => {
                debug!("Keeping paired entry for {}", device.id);
            }
            Some(existing) => {
                if device.name().is_none() {
                    let name = existing.display_name.take();
                    *existing = RawDevice {
                        display_name: name,
                        ..device
                    };
                } else {
                    *existing = device;
                }
            }
            None => {
                self.order.push(device.id.clone());
                self.by_id.insert(device.id.clone(), device);
            }
        }
    }

    fn into_vec(mut self) -> Vec<RawDevice> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .collect()
    }
}

/// Scans a transport for adapters
pub struct DeviceScanner {
    transport: Arc<dyn Transport>,
    config: ScannerConfig,
}

impl DeviceScanner {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ScannerConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ScannerConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan for adapters, best candidates first
    ///
    /// Never fails: discovery errors degrade to the already-known devices,
    /// and a transport that cannot list anything yields an empty list.
    pub async fn scan(&self, window: Duration) -> Vec<Device> {
        info!(
            "Scanning {} for adapters ({} ms window)",
            self.transport.name(),
            window.as_millis()
        );
        let mut set = DeviceSet::default();

        match self.transport.list_available_devices().await {
            Ok(devices) => {
                debug!("{} known device(s)", devices.len());
                for device in devices {
                    set.merge(device);
                }
            }
            Err(e) => warn!("Listing known devices failed: {}", e),
        }

        if self.transport.supports_discovery() {
            if let Err(e) = self.discover(window, &mut set).await {
                warn!("Discovery failed, continuing with known devices: {}", e);
            }
        }

        let mut devices: Vec<Device> = set
            .into_vec()
            .into_iter()
            .filter(|raw| scoring::is_likely_obd2(raw, self.config.include_unnamed))
            .map(|raw| Device::from_raw(&raw))
            .filter(|d| d.is_paired || d.compatibility_score >= self.config.min_score)
            .collect();

        sort_devices(&mut devices);

        if devices.is_empty() {
            info!("No adapters found");
        } else {
            info!("Found {} candidate adapter(s)", devices.len());
            for device in &devices {
                debug!(
                    "  {} [{}] score {}",
                    device.display_name, device.id, device.compatibility_score
                );
            }
        }
        devices
    }

    async fn discover(&self, window: Duration, set: &mut DeviceSet) -> Result<(), TransportError> {
        let mut events = self.transport.begin_discovery().await?;
        let deadline = Instant::now() + window;

        let outcome = loop {
            match timeout_at(deadline, events.recv()).await {
                Ok(Some(DiscoveryEvent::Discovered(device))) => {
                    debug!("Discovered {} ({:?})", device.id, device.display_name);
                    set.merge(device);
                }
                Ok(Some(DiscoveryEvent::Error(reason))) => {
                    break Err(TransportError::DiscoveryFailed(reason));
                }
                Ok(None) => break Ok(()),
                Err(_) => break Ok(()),
            }
        };

        if let Err(e) = self.transport.end_discovery().await {
            debug!("Ending discovery failed: {}", e);
        }
        outcome
    }
}

/// Highest score first; ties go to paired devices, then stronger signal
pub fn sort_devices(devices: &mut [Device]) {
    devices.sort_by(|a, b| {
        b.compatibility_score
            .cmp(&a.compatibility_score)
            .then(b.is_paired.cmp(&a.is_paired))
            .then(b.signal_strength.cmp(&a.signal_strength))
            .then(a.display_name.cmp(&b.display_name))
    });
}
