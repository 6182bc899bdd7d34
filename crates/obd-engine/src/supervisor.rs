//! Connection supervisor
//!
//! Owns the connection state machine and the adapter channel. A connect call
//! walks the device's strategy list with a per-strategy timeout, hands the
//! first open channel to a [`CommandPipeline`], negotiates a bus protocol and
//! then keeps a health monitor running until the link is torn down.
//!
//! # Cancellation
//!
//! Every wait inside `connect()` races a cancellation epoch. `disconnect()`
//! bumps the epoch, so a pending strategy open, backoff or negotiation
//! returns [`EngineError::Cancelled`] right away and its half-open channel is
//! dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let supervisor = ConnectionSupervisor::new(transport);
//! let devices = supervisor.scan(Duration::from_secs(10)).await?;
//! supervisor.connect(&devices[0]).await?;
//! let rpm = supervisor.read_pid(&standard::get(standard::ENGINE_RPM).unwrap()).await?;
//! supervisor.disconnect().await;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use obd_detect::{ConnectStrategy, Device, DeviceScanner, Transport, TransportError};
use obd_protocol::pid::{MODE_CURRENT_DATA, MODE_PENDING_DTCS, MODE_STORED_DTCS};
use obd_protocol::{adapter_error, Dtc, ParsedValue, PidDefinition, ResponseParser};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, HealthConfig};
use crate::error::{CommandError, EngineError, Result, StrategyFailure};
use crate::events::LinkEvent;
use crate::negotiator::ProtocolNegotiator;
use crate::pipeline::{CommandPipeline, PipelineStatus};
use crate::state::{ConnectionState, LinkQuality, NegotiatedProtocol};

const EVENT_CAPACITY: usize = 256;

/// Order in which connection strategies are tried for `device`
///
/// Unpaired devices usually accept an unauthenticated channel, paired ones
/// an authenticated one. The direct channel is the last resort for both.
pub fn strategy_order(device: &Device) -> [ConnectStrategy; 3] {
    if device.is_paired {
        [
            ConnectStrategy::Secure,
            ConnectStrategy::Insecure,
            ConnectStrategy::DirectChannel,
        ]
    } else {
        [
            ConnectStrategy::Insecure,
            ConnectStrategy::Secure,
            ConnectStrategy::DirectChannel,
        ]
    }
}

/// An established connection
struct Session {
    device: Device,
    strategy: ConnectStrategy,
    adapter_version: Option<String>,
    pipeline: Arc<CommandPipeline>,
    health: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    scanner: DeviceScanner,
    config: EngineConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
    session: Mutex<Option<Session>>,
    attempts: Mutex<HashMap<String, u32>>,
    /// Held by a connect attempt or a scan; they never overlap
    activity: Mutex<()>,
    cancel_tx: watch::Sender<u64>,
}

/// Drives scanning, connection, negotiation and health monitoring
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, EngineConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let scanner = DeviceScanner::with_config(transport.clone(), config.scanner.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                transport,
                scanner,
                config,
                state_tx,
                events,
                session: Mutex::new(None),
                attempts: Mutex::new(HashMap::new()),
                activity: Mutex::new(()),
                cancel_tx,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current state snapshot
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// State stream for UI binding
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Traffic, milestones and state changes
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Find candidate adapters
    ///
    /// Rejected with [`EngineError::Busy`] while a connection attempt runs.
    /// Discovery problems only shrink the result.
    pub async fn scan(&self, window: Duration) -> Result<Vec<Device>> {
        let _activity = self
            .inner
            .activity
            .try_lock()
            .map_err(|_| EngineError::Busy("a connection attempt is in progress"))?;

        let previous = self.state();
        let marked = matches!(
            previous,
            ConnectionState::Idle | ConnectionState::Disconnected { .. }
        ) && self.inner.transition(ConnectionState::Scanning);

        let devices = self.inner.scanner.scan(window).await;
        info!("Scan found {} candidate device(s)", devices.len());

        if marked {
            // A disconnect during the scan already moved the state on
            let restored = self.inner.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Scanning {
                    *state = previous.clone();
                    true
                } else {
                    false
                }
            });
            if restored {
                let _ = self.inner.events.send(LinkEvent::StateChanged(previous));
            }
        }
        Ok(devices)
    }

    /// Open, negotiate and supervise a connection to `device`
    ///
    /// An existing connection is closed first. Each call uses one of the
    /// device's attempts; once they are used up the call fails until
    /// [`reset_attempts`](Self::reset_attempts) is called.
    pub async fn connect(&self, device: &Device) -> Result<()> {
        let inner = &self.inner;
        let epoch = *inner.cancel_tx.borrow();

        let _activity = tokio::select! {
            guard = inner.activity.lock() => guard,
            _ = inner.cancelled(epoch) => return Err(EngineError::Cancelled),
        };

        if inner.close_session(Some("replaced by a new connection".into())).await {
            info!("Closed the previous connection before connecting to {}", device.id);
        }

        let attempt = {
            let mut attempts = inner.attempts.lock().await;
            let used = attempts.entry(device.id.clone()).or_insert(0);
            if *used >= inner.config.connect.max_attempts {
                warn!("{} has no connection attempts left", device.id);
                return Err(EngineError::AttemptsExhausted {
                    device: device.id.clone(),
                    attempts: *used,
                });
            }
            *used += 1;
            *used
        };
        info!(
            "Connecting to {} ({}), attempt {}/{}",
            device.display_name, device.id, attempt, inner.config.connect.max_attempts
        );

        let mut failures = Vec::new();
        let mut opened = None;
        for (index, strategy) in strategy_order(device).into_iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = sleep(inner.config.connect.backoff()) => {}
                    _ = inner.cancelled(epoch) => return Err(inner.cancel_connect()),
                }
            }

            inner.transition(ConnectionState::Connecting {
                device: device.clone(),
                strategy_index: index,
                attempt,
            });
            let limit = inner.config.connect.strategy_timeout(index);
            debug!("Opening {} via {} (timeout {:?})", device.id, strategy, limit);

            // Losing the race drops the open future, so a late channel is never kept
            let result = tokio::select! {
                result = timeout(limit, inner.transport.open(&device.id, strategy)) => result,
                _ = inner.cancelled(epoch) => return Err(inner.cancel_connect()),
            };

            let reason = match result {
                Ok(Ok(stream)) => {
                    opened = Some((strategy, stream));
                    break;
                }
                Ok(Err(TransportError::Unavailable(reason))) => {
                    let err = EngineError::TransportUnavailable(reason);
                    inner.fail(&err, "connect");
                    return Err(err);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", limit.as_millis()),
            };
            warn!("Strategy {} failed for {}: {}", strategy, device.id, reason);
            failures.push(StrategyFailure { strategy, reason });
        }

        let Some((strategy, stream)) = opened else {
            let err = EngineError::ConnectionStrategyFailed {
                device: device.id.clone(),
                failures,
            };
            inner.fail(&err, "connect");
            return Err(err);
        };
        info!("Channel to {} open via {}", device.id, strategy);

        inner.transition(ConnectionState::Negotiating {
            device: device.clone(),
        });
        let pipeline = Arc::new(CommandPipeline::spawn(
            stream,
            inner.config.pipeline.clone(),
            inner.events.clone(),
        ));
        let negotiator = ProtocolNegotiator::new(inner.config.negotiation.clone());

        let negotiated = tokio::select! {
            result = negotiator.negotiate(&pipeline) => result,
            _ = inner.cancelled(epoch) => {
                pipeline.shutdown().await;
                return Err(inner.cancel_connect());
            }
        };
        let outcome = match negotiated {
            Ok(outcome) => outcome,
            Err(err) => {
                pipeline.shutdown().await;
                inner.fail(&err, "negotiation");
                return Err(err);
            }
        };

        let mut session = inner.session.lock().await;
        if *inner.cancel_tx.borrow() != epoch {
            drop(session);
            pipeline.shutdown().await;
            return Err(inner.cancel_connect());
        }

        inner.transition(ConnectionState::Ready {
            device: device.clone(),
            protocol: outcome.protocol.clone(),
        });
        inner.attempts.lock().await.remove(&device.id);

        let health = tokio::spawn(run_health_monitor(
            Arc::downgrade(&self.inner),
            pipeline.clone(),
            inner.config.health.clone(),
        ));
        *session = Some(Session {
            device: device.clone(),
            strategy,
            adapter_version: outcome.adapter_version.clone(),
            pipeline,
            health: Some(health),
        });
        drop(session);

        info!(
            "Connected to {} on protocol {} ({})",
            device.display_name, outcome.protocol.code, outcome.protocol.display_name
        );
        let _ = inner.events.send(LinkEvent::Connected {
            device_id: device.id.clone(),
            display_name: device.display_name.clone(),
            strategy,
            protocol: outcome.protocol,
            adapter_version: outcome.adapter_version,
        });
        Ok(())
    }

    /// Close the connection and abort any connection attempt in progress
    ///
    /// Safe in every state; calling it again changes nothing.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.cancel_tx.send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        if !inner.close_session(None).await && !self.state().is_disconnected() {
            inner.transition(ConnectionState::Disconnected { reason: None });
        }
    }

    /// Send a raw command and return the cleaned response
    pub async fn send_command(&self, text: &str, timeout: Duration) -> Result<String> {
        let pipeline = self.pipeline().await?;
        Ok(pipeline.submit(text, timeout).await?)
    }

    /// Request a PID and decode the answer
    pub async fn read_pid(&self, pid: &PidDefinition) -> Result<ParsedValue> {
        let timeout = self.inner.config.pipeline.default_timeout();
        let response = self.send_command(&pid.command(), timeout).await?;
        Ok(ResponseParser::parse(pid, &response)?)
    }

    /// Stored trouble codes (mode 03)
    pub async fn read_dtcs(&self) -> Result<Vec<Dtc>> {
        self.read_codes(MODE_STORED_DTCS).await
    }

    /// Codes detected during the current drive cycle (mode 07)
    pub async fn read_pending_dtcs(&self) -> Result<Vec<Dtc>> {
        self.read_codes(MODE_PENDING_DTCS).await
    }

    async fn read_codes(&self, mode: u8) -> Result<Vec<Dtc>> {
        let timeout = self.inner.config.pipeline.default_timeout();
        let response = self.send_command(&format!("{:02X}", mode), timeout).await?;
        let codes = ResponseParser::parse_dtcs(mode, &response)?;
        debug!("Mode {:02X} reported {} code(s)", mode, codes.len());
        Ok(codes)
    }

    /// Clear stored codes and freeze frames (mode 04)
    pub async fn clear_dtcs(&self) -> Result<()> {
        let timeout = self.inner.config.pipeline.default_timeout();
        let response = self.send_command("04", timeout).await?;
        ResponseParser::confirm_cleared(&response)?;
        info!("Trouble codes cleared");
        Ok(())
    }

    /// Vehicle identification number (mode 09, info type 02)
    pub async fn read_vin(&self) -> Result<String> {
        let timeout = self.inner.config.pipeline.default_timeout();
        let response = self.send_command("0902", timeout).await?;
        Ok(ResponseParser::parse_vin(&response)?)
    }

    /// Mode 01 PIDs the vehicle reports as supported
    ///
    /// Follows the bitmap chain: `0100` is always asked, `0120` and later only
    /// while the previous bitmap flags the next range.
    pub async fn supported_pids(&self) -> Result<Vec<u16>> {
        let timeout = self.inner.config.pipeline.default_timeout();
        let mut supported = Vec::new();
        let mut base = 0u8;
        loop {
            let command = format!("{:02X}{:02X}", MODE_CURRENT_DATA, base);
            let pids = match self
                .send_command(&command, timeout)
                .await
                .and_then(|response| Ok(ResponseParser::parse_supported_pids(base, &response)?))
            {
                Ok(pids) => pids,
                Err(e) if base == 0 => return Err(e),
                Err(e) => {
                    warn!("Stopping PID discovery at {}: {}", command, e);
                    break;
                }
            };
            let next = base as u16 + 0x20;
            let more = pids.contains(&next);
            supported.extend(pids);
            if !more || base >= 0xE0 {
                break;
            }
            base += 0x20;
        }
        Ok(supported)
    }

    /// Allow `device_id` to be connected again after its attempts ran out
    pub async fn reset_attempts(&self, device_id: &str) {
        if self.inner.attempts.lock().await.remove(device_id).is_some() {
            debug!("Reset connection attempts for {}", device_id);
        }
    }

    pub async fn reset_all_attempts(&self) {
        self.inner.attempts.lock().await.clear();
    }

    /// Attempts `device_id` has used since its last success or reset
    pub async fn attempts(&self, device_id: &str) -> u32 {
        self.inner
            .attempts
            .lock()
            .await
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Strategy that opened the current connection
    pub async fn active_strategy(&self) -> Option<ConnectStrategy> {
        self.inner.session.lock().await.as_ref().map(|s| s.strategy)
    }

    /// Identity string the adapter reported while negotiating
    pub async fn adapter_version(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.adapter_version.clone())
    }

    pub fn negotiated_protocol(&self) -> Option<NegotiatedProtocol> {
        self.inner.state_tx.borrow().protocol().cloned()
    }

    async fn pipeline(&self) -> Result<Arc<CommandPipeline>> {
        let state = self.state();
        if !state.accepts_commands() {
            return Err(EngineError::NotReady(state.name()));
        }
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.pipeline.clone())
            .ok_or(EngineError::NotReady(state.name()))
    }
}

impl Inner {
    /// Apply a state change if it is legal; returns whether it happened
    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                warn!(
                    "Ignoring transition {} -> {}",
                    current.name(),
                    next.name()
                );
                return false;
            }
            debug!("State {} -> {}", current.name(), next.name());
            *current = next.clone();
            true
        });
        if changed {
            let _ = self.events.send(LinkEvent::StateChanged(next));
        }
        changed
    }

    /// Resolves once `disconnect()` has been called after `epoch` was taken
    async fn cancelled(&self, epoch: u64) {
        let mut rx = self.cancel_tx.subscribe();
        let _ = rx.wait_for(|current| *current != epoch).await;
    }

    fn cancel_connect(&self) -> EngineError {
        info!("Connection attempt cancelled");
        self.transition(ConnectionState::Disconnected { reason: None });
        EngineError::Cancelled
    }

    fn fail(&self, err: &EngineError, source: &str) {
        warn!("{} failed: {}", source, err);
        let _ = self.events.send(LinkEvent::Error {
            source: source.to_string(),
            message: err.to_string(),
        });
        self.transition(ConnectionState::Disconnected {
            reason: Some(err.to_string()),
        });
    }

    /// Tear down the current session; returns false if there was none
    ///
    /// The health monitor is stopped before the pipeline goes away.
    async fn close_session(&self, reason: Option<String>) -> bool {
        let mut session = self.session.lock().await;
        let Some(mut current) = session.take() else {
            return false;
        };
        if let Some(health) = current.health.take() {
            health.abort();
            let _ = health.await;
        }
        self.finish_session(current, reason).await;
        true
    }

    /// Called by the health monitor of the session using `pipeline`
    async fn close_monitored(&self, pipeline: &Arc<CommandPipeline>, reason: String) {
        let mut session = self.session.lock().await;
        let owned = session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.pipeline, pipeline));
        if !owned {
            return;
        }
        if let Some(mut current) = session.take() {
            // This task is the monitor; detach rather than abort itself
            current.health = None;
            self.finish_session(current, Some(reason)).await;
        }
    }

    async fn finish_session(&self, session: Session, reason: Option<String>) {
        session.pipeline.shutdown().await;
        match &reason {
            Some(reason) => warn!("Disconnected from {}: {}", session.device.id, reason),
            None => info!("Disconnected from {}", session.device.id),
        }
        let _ = self.events.send(LinkEvent::Disconnected {
            device_id: session.device.id.clone(),
            reason: reason.clone(),
        });
        self.transition(ConnectionState::Disconnected { reason });
    }

    fn demote(&self, reason: String, quality: LinkQuality) {
        let current = self.state_tx.borrow().clone();
        if let (Some(device), Some(protocol)) = (current.device(), current.protocol()) {
            self.transition(ConnectionState::Degraded {
                device: device.clone(),
                protocol: protocol.clone(),
                reason,
                quality,
            });
        }
    }

    fn recover(&self) {
        let current = self.state_tx.borrow().clone();
        if let ConnectionState::Degraded {
            device, protocol, ..
        } = current
        {
            info!("Link to {} recovered", device.id);
            self.transition(ConnectionState::Ready { device, protocol });
        }
    }
}

/// Periodic adapter probe for one session
async fn run_health_monitor(
    supervisor: Weak<Inner>,
    pipeline: Arc<CommandPipeline>,
    config: HealthConfig,
) {
    let period = config.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;
    let mut last_success = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            status = pipeline.closed() => {
                let reason = match status {
                    PipelineStatus::Lost(reason) => format!("connection lost: {}", reason),
                    _ => "connection closed".to_string(),
                };
                if let Some(inner) = supervisor.upgrade() {
                    inner.close_monitored(&pipeline, reason).await;
                }
                return;
            }
        }

        let started = Instant::now();
        let result = pipeline
            .submit(&config.probe_command, config.probe_timeout())
            .await;
        let latency = started.elapsed();
        let Some(inner) = supervisor.upgrade() else {
            return;
        };

        let failure = match result {
            Ok(response) => match adapter_error(&response) {
                None => {
                    let quality = LinkQuality::from_latency(latency, &config);
                    debug!("Health probe ok in {:?} ({:?})", latency, quality);
                    let _ = inner.events.send(LinkEvent::HealthProbe {
                        latency_ms: latency.as_millis() as u64,
                        quality,
                        ok: true,
                    });
                    failures = 0;
                    last_success = Instant::now();
                    inner.recover();
                    continue;
                }
                Some(error) => (
                    format!("health probe rejected: {}", error),
                    LinkQuality::from_latency(latency, &config),
                    false,
                ),
            },
            Err(CommandError::Timeout { .. }) => (
                format!("health probe timed out after {:?}", config.probe_timeout()),
                LinkQuality::Poor,
                false,
            ),
            Err(e) => (e.to_string(), LinkQuality::Poor, true),
        };

        let (reason, quality, fatal) = failure;
        failures += 1;
        let _ = inner.events.send(LinkEvent::HealthProbe {
            latency_ms: latency.as_millis() as u64,
            quality,
            ok: false,
        });

        if fatal
            || failures >= config.max_consecutive_failures
            || last_success.elapsed() >= config.max_failure_age()
        {
            warn!("Health check failed {} time(s): {}", failures, reason);
            inner.close_monitored(&pipeline, reason).await;
            return;
        }
        warn!("Health probe failed: {}", reason);
        inner.demote(reason, quality);
    }
}
