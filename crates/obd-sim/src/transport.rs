//! Scripted transport backed by virtual adapters
//!
//! Each [`SimDevice`] describes how a device shows up (known list or
//! discovery), which connection strategies fail or hang, and the virtual
//! adapter that answers once a channel opens. Every open attempt is recorded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obd_detect::{
    AdapterStream, ConnectStrategy, DiscoveryEvent, RawDevice, Transport, TransportError,
};
use tokio::io::duplex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::adapter::{VirtualElm327, VirtualElm327Config};
use crate::adapter_task::{run_virtual_adapter_task, SharedAdapter, VirtualAdapterCommand};

/// A simulated device and how it behaves
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub raw: RawDevice,
    pub adapter: VirtualElm327Config,
    pub failing_strategies: HashSet<ConnectStrategy>,
    pub hanging_strategies: HashSet<ConnectStrategy>,
}

impl SimDevice {
    pub fn new(raw: RawDevice) -> Self {
        Self {
            raw,
            adapter: VirtualElm327Config::default(),
            failing_strategies: HashSet::new(),
            hanging_strategies: HashSet::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: VirtualElm327Config) -> Self {
        self.adapter = adapter;
        self
    }

    /// Opening with `strategy` returns an error
    pub fn failing(mut self, strategy: ConnectStrategy) -> Self {
        self.failing_strategies.insert(strategy);
        self
    }

    /// Opening with `strategy` never completes
    pub fn hanging(mut self, strategy: ConnectStrategy) -> Self {
        self.hanging_strategies.insert(strategy);
        self
    }
}

/// What happened to one open attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Failed,
    Hung,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub device_id: String,
    pub strategy: ConnectStrategy,
    pub outcome: OpenOutcome,
}

struct SimLink {
    adapter: SharedAdapter,
    control: mpsc::Sender<VirtualAdapterCommand>,
}

/// Transport over virtual adapters
pub struct SimTransport {
    devices: Vec<SimDevice>,
    discovery_supported: bool,
    listing_fails: bool,
    discovery_fails: bool,
    powered_off: bool,
    discovery_interval: Duration,
    opens: Mutex<Vec<OpenRecord>>,
    links: Mutex<HashMap<String, SimLink>>,
    active_links: Arc<AtomicUsize>,
}

impl SimTransport {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            discovery_supported: true,
            listing_fails: false,
            discovery_fails: false,
            powered_off: false,
            discovery_interval: Duration::from_millis(200),
            opens: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            active_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A single paired ELM327 on CAN 11-bit/500k
    pub fn demo() -> Self {
        Self::new(vec![
            SimDevice::new(RawDevice::paired("00:1D:A5:68:98:8B", "OBDII ELM327 v1.5")),
            SimDevice::new(RawDevice::discovered(
                "66:1E:32:00:12:34",
                Some("Vgate iCar Pro"),
                Some(-58),
            ))
            .failing(ConnectStrategy::Insecure),
            SimDevice::new(RawDevice::discovered(
                "F4:4E:FD:10:20:30",
                Some("JBL Flip 5"),
                Some(-45),
            )),
        ])
    }

    pub fn without_discovery(mut self) -> Self {
        self.discovery_supported = false;
        self
    }

    pub fn with_listing_failure(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    pub fn with_discovery_failure(mut self) -> Self {
        self.discovery_fails = true;
        self
    }

    /// No radio at all: listing and opening report the transport unavailable
    pub fn powered_off(mut self) -> Self {
        self.powered_off = true;
        self.listing_fails = true;
        self
    }

    /// Every open attempt so far, in order
    pub async fn open_log(&self) -> Vec<OpenRecord> {
        self.opens.lock().await.clone()
    }

    /// Number of adapter tasks with a live channel
    pub fn active_links(&self) -> usize {
        self.active_links.load(Ordering::SeqCst)
    }

    /// The virtual adapter behind the most recent channel to `device_id`
    pub async fn adapter(&self, device_id: &str) -> Option<SharedAdapter> {
        self.links
            .lock()
            .await
            .get(device_id)
            .map(|link| link.adapter.clone())
    }

    /// Drop the channel to `device_id` from the adapter side
    pub async fn drop_link(&self, device_id: &str) -> bool {
        let link = self.links.lock().await.remove(device_id);
        match link {
            Some(link) => link.control.send(VirtualAdapterCommand::Disconnect).await.is_ok(),
            None => false,
        }
    }

    fn device(&self, device_id: &str) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.raw.id == device_id)
    }

    async fn record(&self, device_id: &str, strategy: ConnectStrategy, outcome: OpenOutcome) {
        self.opens.lock().await.push(OpenRecord {
            device_id: device_id.to_string(),
            strategy,
            outcome,
        });
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn list_available_devices(&self) -> Result<Vec<RawDevice>, TransportError> {
        if self.listing_fails {
            return Err(TransportError::Unavailable("simulated radio is off".into()));
        }
        Ok(self
            .devices
            .iter()
            .filter(|d| d.raw.already_paired)
            .map(|d| d.raw.clone())
            .collect())
    }

    fn supports_discovery(&self) -> bool {
        self.discovery_supported
    }

    async fn begin_discovery(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TransportError> {
        if !self.discovery_supported {
            return Err(TransportError::DiscoveryUnsupported);
        }
        if self.discovery_fails {
            return Err(TransportError::DiscoveryFailed("simulated discovery failure".into()));
        }

        let found: Vec<RawDevice> = self
            .devices
            .iter()
            .filter(|d| !d.raw.already_paired)
            .map(|d| d.raw.clone())
            .collect();
        let interval = self.discovery_interval;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for device in found {
                tokio::time::sleep(interval).await;
                if tx.send(DiscoveryEvent::Discovered(device)).await.is_err() {
                    return;
                }
            }
            // Discovery stays open until the scanner's window closes
            tx.closed().await;
        });
        Ok(rx)
    }

    async fn open(
        &self,
        device_id: &str,
        strategy: ConnectStrategy,
    ) -> Result<AdapterStream, TransportError> {
        if self.powered_off {
            return Err(TransportError::Unavailable("simulated radio is off".into()));
        }
        let Some(device) = self.device(device_id) else {
            return Err(TransportError::DeviceNotFound(device_id.to_string()));
        };

        if device.hanging_strategies.contains(&strategy) {
            debug!("Simulated open of {} via {} hangs", device_id, strategy);
            self.record(device_id, strategy, OpenOutcome::Hung).await;
            std::future::pending::<()>().await;
        }

        if device.failing_strategies.contains(&strategy) {
            self.record(device_id, strategy, OpenOutcome::Failed).await;
            return Err(TransportError::OpenFailed {
                device: device_id.to_string(),
                strategy,
                reason: "simulated connection refused".into(),
            });
        }

        let (client, server) = duplex(4096);
        let adapter: SharedAdapter = Arc::new(Mutex::new(VirtualElm327::new(device.adapter.clone())));
        let (control, control_rx) = mpsc::channel(4);

        let active = self.active_links.clone();
        active.fetch_add(1, Ordering::SeqCst);
        let task_adapter = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = run_virtual_adapter_task(server, task_adapter, control_rx).await {
                debug!("Virtual adapter task error: {}", e);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });

        self.links
            .lock()
            .await
            .insert(device_id.to_string(), SimLink { adapter, control });
        self.record(device_id, strategy, OpenOutcome::Opened).await;
        info!("Simulated channel to {} open via {}", device_id, strategy);

        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listing_only_returns_paired() {
        let transport = SimTransport::demo();
        let known = transport.list_available_devices().await.unwrap();
        assert_eq!(known.len(), 1);
        assert!(known[0].already_paired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_reports_unpaired() {
        let transport = SimTransport::demo();
        let mut rx = transport.begin_discovery().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..2 {
            if let Some(DiscoveryEvent::Discovered(d)) = rx.recv().await {
                ids.push(d.id);
            }
        }
        assert_eq!(ids, vec!["66:1E:32:00:12:34", "F4:4E:FD:10:20:30"]);
    }

    #[tokio::test]
    async fn test_failing_strategy_is_recorded() {
        let transport = SimTransport::demo();
        let result = transport
            .open("66:1E:32:00:12:34", ConnectStrategy::Insecure)
            .await;
        assert!(matches!(result, Err(TransportError::OpenFailed { .. })));
        assert_eq!(
            transport.open_log().await,
            vec![OpenRecord {
                device_id: "66:1E:32:00:12:34".into(),
                strategy: ConnectStrategy::Insecure,
                outcome: OpenOutcome::Failed,
            }]
        );
        assert_eq!(transport.active_links(), 0);
    }

    #[tokio::test]
    async fn test_open_talks_to_adapter_and_drop_link() {
        let transport = SimTransport::demo();
        let mut stream = transport
            .open("00:1D:A5:68:98:8B", ConnectStrategy::Secure)
            .await
            .unwrap();
        assert_eq!(transport.active_links(), 1);

        stream.write_all(b"ATI\r").await.unwrap();
        let mut buf = [0u8; 64];
        let mut reply = Vec::new();
        while !reply.contains(&b'>') {
            let n = stream.read(&mut buf).await.unwrap();
            reply.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&reply).contains("ELM327 v1.5"));

        assert!(transport.drop_link("00:1D:A5:68:98:8B").await);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let transport = SimTransport::new(Vec::new());
        assert!(matches!(
            transport.open("nope", ConnectStrategy::Secure).await,
            Err(TransportError::DeviceNotFound(_))
        ));
    }
}
