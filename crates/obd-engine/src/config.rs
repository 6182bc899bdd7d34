//! Engine configuration
//!
//! Every timing and threshold the engine uses lives here so hosts can tune
//! them from a settings file. Defaults match what common ELM327 clones need.

use std::time::Duration;

use obd_detect::ScannerConfig;
use obd_protocol::elm::at;
use obd_protocol::ObdProtocol;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scanner: ScannerConfig,
    pub connect: ConnectConfig,
    pub negotiation: NegotiatorConfig,
    pub pipeline: PipelineConfig,
    pub health: HealthConfig,
}

/// Connection establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Connect calls allowed per device before an explicit reset is required
    pub max_attempts: u32,
    /// Timeout for each strategy by position; the last entry repeats
    pub strategy_timeouts_ms: Vec<u64>,
    /// Pause between two strategies
    pub strategy_backoff_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy_timeouts_ms: vec![15_000, 20_000, 30_000],
            strategy_backoff_ms: 1_000,
        }
    }
}

impl ConnectConfig {
    pub fn strategy_timeout(&self, index: usize) -> Duration {
        let ms = self
            .strategy_timeouts_ms
            .get(index)
            .or(self.strategy_timeouts_ms.last())
            .copied()
            .unwrap_or(20_000);
        Duration::from_millis(ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.strategy_backoff_ms)
    }
}

/// Adapter initialization and protocol search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    pub reset_timeout_ms: u64,
    /// Wait after `ATZ` before the adapter accepts commands again
    pub reset_settle_ms: u64,
    pub init_timeout_ms: u64,
    /// Send `ATH1` instead of `ATH0`
    pub headers: bool,
    /// Value passed to `ATST`
    pub adapter_timeout_ms: u32,
    /// Explicit candidates, tried in order before the automatic fallback
    pub candidates: Vec<ObdProtocol>,
    /// Wait after `ATSPn` before probing
    pub settle_ms: u64,
    /// PID requests used to check a protocol
    pub probes: Vec<String>,
    pub probe_timeout_ms: u64,
    /// Valid probes needed to accept an explicit candidate
    pub explicit_threshold: usize,
    /// Valid probes needed to accept the automatic fallback
    pub automatic_threshold: usize,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            reset_timeout_ms: 3_000,
            reset_settle_ms: 1_000,
            init_timeout_ms: 2_000,
            headers: false,
            adapter_timeout_ms: 400,
            candidates: ObdProtocol::PRIORITY.to_vec(),
            settle_ms: 300,
            probes: vec![
                "0100".to_string(),
                "010C".to_string(),
                "010D".to_string(),
                "0105".to_string(),
            ],
            probe_timeout_ms: 5_000,
            explicit_threshold: 2,
            automatic_threshold: 1,
        }
    }
}

impl NegotiatorConfig {
    /// Configuration sequence sent after reset
    pub fn init_commands(&self) -> Vec<String> {
        vec![
            at::ECHO_OFF.to_string(),
            at::LINEFEEDS_OFF.to_string(),
            at::SPACES_OFF.to_string(),
            if self.headers { at::HEADERS_ON } else { at::HEADERS_OFF }.to_string(),
            at::ADAPTIVE_TIMING_ON.to_string(),
            at::set_timeout(self.adapter_timeout_ms),
        ]
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Command pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum gap between the end of one command and the next write
    pub inter_command_delay_ms: u64,
    /// Timeout for PID reads
    pub default_timeout_ms: u64,
    /// Submissions that can wait before callers block
    pub queue_depth: usize,
    /// How long to wait for the rest of a timed-out answer before the next
    /// write; a little over the adapter's own ATST timeout
    pub recovery_window_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inter_command_delay_ms: 100,
            default_timeout_ms: 5_000,
            queue_depth: 32,
            recovery_window_ms: 500,
        }
    }
}

impl PipelineConfig {
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Health monitoring while connected
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_command: String,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failures that drop the connection
    pub max_consecutive_failures: u32,
    /// A failure this long after the last good probe drops the connection
    pub max_failure_age_ms: u64,
    pub excellent_below_ms: u64,
    pub good_below_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_command: at::IDENTIFY.to_string(),
            interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            max_consecutive_failures: 2,
            max_failure_age_ms: 20_000,
            excellent_below_ms: 250,
            good_below_ms: 750,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn max_failure_age(&self) -> Duration {
        Duration::from_millis(self.max_failure_age_ms)
    }
}
