//! Serial-port transport
//!
//! Covers USB adapters and Bluetooth SPP adapters the OS already exposes as
//! a serial device (`/dev/rfcomm0`, `COM5`, `/dev/tty.OBDII-SPPDev`). The OS
//! owns pairing, so there is no discovery and a single way to open a port.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::transport::{AdapterStream, ConnectStrategy, RawDevice, Transport};

/// The only strategy a serial port answers to
///
/// Ports show up as paired devices, so this is also the first one tried.
pub const SERIAL_STRATEGY: ConnectStrategy = ConnectStrategy::Secure;

/// Serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Most ELM327 clones ship at 38400; some at 9600 or 115200
    pub baud_rate: u32,
    /// Skip ports whose name contains any of these
    pub skip_patterns: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 38_400,
            skip_patterns: vec!["debug".to_string(), "Bluetooth-Incoming-Port".to_string()],
        }
    }
}

pub struct SerialTransport {
    config: SerialConfig,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::with_config(SerialConfig::default())
    }

    pub fn with_config(config: SerialConfig) -> Self {
        Self { config }
    }

    fn should_skip_port(&self, port_name: &str) -> bool {
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| port_name.contains(pattern.as_str()))
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn raw_device(port_name: String, port_type: &SerialPortType) -> RawDevice {
    let name = match port_type {
        SerialPortType::UsbPort(usb) => usb.product.clone().or_else(|| usb.manufacturer.clone()),
        SerialPortType::BluetoothPort => Some(format!("Bluetooth {}", port_name)),
        _ => None,
    };
    RawDevice {
        display_name: name.or_else(|| Some(port_name.clone())),
        id: port_name,
        signal_strength: None,
        // A port the OS exposes is already bonded or wired
        already_paired: true,
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    async fn list_available_devices(&self) -> Result<Vec<RawDevice>, TransportError> {
        let ports =
            available_ports().map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        let devices: Vec<_> = ports
            .into_iter()
            .filter(|p| !self.should_skip_port(&p.port_name))
            .map(|p| raw_device(p.port_name, &p.port_type))
            .collect();

        info!("Found {} serial port(s)", devices.len());
        Ok(devices)
    }

    async fn open(
        &self,
        device_id: &str,
        strategy: ConnectStrategy,
    ) -> Result<AdapterStream, TransportError> {
        if strategy != SERIAL_STRATEGY {
            return Err(TransportError::OpenFailed {
                device: device_id.to_string(),
                strategy,
                reason: format!("serial ports open only via the {} path", SERIAL_STRATEGY),
            });
        }
        debug!("Opening {} at {} baud", device_id, self.config.baud_rate);
        let stream = tokio_serial::new(device_id, self.config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed {
                device: device_id.to_string(),
                strategy,
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 38_400);
    }

    #[test]
    fn test_skip_patterns() {
        let transport = SerialTransport::new();
        assert!(transport.should_skip_port("/dev/tty.Bluetooth-Incoming-Port"));
        assert!(!transport.should_skip_port("/dev/rfcomm0"));
    }

    #[test]
    fn test_raw_device_naming() {
        let device = raw_device("/dev/rfcomm0".into(), &SerialPortType::BluetoothPort);
        assert_eq!(device.display_name.as_deref(), Some("Bluetooth /dev/rfcomm0"));
        assert!(device.already_paired);

        let device = raw_device("COM3".into(), &SerialPortType::Unknown);
        assert_eq!(device.display_name.as_deref(), Some("COM3"));
    }

    #[tokio::test]
    async fn test_other_strategies_fail_without_touching_the_port() {
        let transport = SerialTransport::new();
        for strategy in [ConnectStrategy::Insecure, ConnectStrategy::DirectChannel] {
            match transport.open("/dev/obd-missing-port", strategy).await {
                Err(TransportError::OpenFailed { strategy: failed, reason, .. }) => {
                    assert_eq!(failed, strategy);
                    assert!(reason.contains("only via the secure path"), "{}", reason);
                }
                Err(other) => panic!("unexpected error {:?}", other),
                Ok(_) => panic!("{} should not open a serial port", strategy),
            }
        }
    }

    #[tokio::test]
    async fn test_secure_strategy_reaches_the_port() {
        let transport = SerialTransport::new();
        match transport.open("/dev/obd-missing-port", SERIAL_STRATEGY).await {
            Err(TransportError::OpenFailed { reason, .. }) => {
                assert!(!reason.contains("only via"), "{}", reason);
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("a missing port should not open"),
        }
    }
}
