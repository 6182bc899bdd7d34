//! Integration tests for the OBD2 engine
//!
//! These tests drive the full stack against simulated adapters:
//! - Strategy fallback, timeouts and cancellation
//! - Protocol negotiation order and failure reporting
//! - Health monitoring, link loss and disconnect idempotence
//! - Attempt accounting and the scan/connect exclusion
//! - Trouble codes, VIN and supported-PID discovery

use std::sync::Arc;
use std::time::Duration;

use obd_detect::{ConnectStrategy, Device, RawDevice};
use obd_engine::{
    ConnectionState, ConnectionSupervisor, EngineConfig, EngineError, LinkEvent, LinkQuality,
};
use obd_protocol::pid::standard;
use obd_protocol::ObdProtocol;
use obd_sim::{OpenOutcome, SimDevice, SimTransport, VirtualElm327Config};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const PAIRED_ID: &str = "00:1D:A5:68:98:8B";
    pub const UNPAIRED_ID: &str = "66:1E:32:00:12:34";

    pub fn paired() -> SimDevice {
        SimDevice::new(RawDevice::paired(PAIRED_ID, "OBDII ELM327 v1.5"))
    }

    pub fn unpaired() -> SimDevice {
        SimDevice::new(RawDevice::discovered(UNPAIRED_ID, Some("Vgate iCar Pro"), Some(-58)))
    }

    pub fn device(sim: &SimDevice) -> Device {
        Device::from_raw(&sim.raw)
    }

    /// Supervisor over a single simulated device
    pub fn setup(sim: SimDevice) -> (ConnectionSupervisor, Arc<SimTransport>, Device) {
        setup_with_config(sim, EngineConfig::default())
    }

    pub fn setup_with_config(
        sim: SimDevice,
        config: EngineConfig,
    ) -> (ConnectionSupervisor, Arc<SimTransport>, Device) {
        let device = device(&sim);
        let transport = Arc::new(SimTransport::new(vec![sim]));
        let supervisor = ConnectionSupervisor::with_config(transport.clone(), config);
        (supervisor, transport, device)
    }

    /// Drain buffered events
    pub fn drain(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn state_names(events: &[LinkEvent]) -> Vec<&'static str> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::StateChanged(state) => Some(state.name()),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_reason(state: &ConnectionState) -> Option<String> {
        match state {
            ConnectionState::Disconnected { reason } => reason.clone(),
            _ => None,
        }
    }
}

use helpers::*;

// ============================================================================
// Connection Strategies
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_strategy_succeeds() {
    let (supervisor, transport, device) = setup(unpaired().failing(ConnectStrategy::Insecure));
    let mut events = supervisor.events();

    supervisor.connect(&device).await.unwrap();

    assert!(supervisor.state().is_ready());
    let log = transport.open_log().await;
    let outcomes: Vec<_> = log.iter().map(|r| (r.strategy, r.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (ConnectStrategy::Insecure, OpenOutcome::Failed),
            (ConnectStrategy::Secure, OpenOutcome::Opened),
        ]
    );
    assert_eq!(supervisor.active_strategy().await, Some(ConnectStrategy::Secure));
    assert_eq!(transport.active_links(), 1);

    let events = drain(&mut events);
    assert_eq!(
        state_names(&events),
        vec!["connecting", "connecting", "negotiating", "ready"]
    );
    let indexes: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            LinkEvent::StateChanged(ConnectionState::Connecting { strategy_index, .. }) => {
                Some(*strategy_index)
            }
            _ => None,
        })
        .collect();
    assert_eq!(indexes, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_strategy_is_abandoned() {
    let (supervisor, transport, device) = setup(paired().hanging(ConnectStrategy::Secure));
    let started = Instant::now();

    supervisor.connect(&device).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(15));
    let log = transport.open_log().await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].strategy, ConnectStrategy::Secure);
    assert_eq!(log[0].outcome, OpenOutcome::Hung);
    assert_eq!(log[1].strategy, ConnectStrategy::Insecure);
    assert_eq!(log[1].outcome, OpenOutcome::Opened);
    assert_eq!(transport.active_links(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_strategy() {
    let sim = paired()
        .hanging(ConnectStrategy::Secure)
        .hanging(ConnectStrategy::Insecure)
        .hanging(ConnectStrategy::DirectChannel);
    let (supervisor, transport, device) = setup(sim);

    let task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(&device).await })
    };
    sleep(Duration::from_secs(1)).await;
    assert_eq!(supervisor.state().name(), "connecting");

    let started = Instant::now();
    supervisor.disconnect().await;
    let result = task.await.unwrap();

    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(supervisor.state().is_disconnected());
    assert_eq!(transport.open_log().await.len(), 1);
    assert_eq!(transport.active_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_negotiation() {
    let adapter = VirtualElm327Config {
        response_delay_ms: 1_000,
        ..VirtualElm327Config::default()
    };
    let (supervisor, transport, device) = setup(paired().with_adapter(adapter));
    let mut state_rx = supervisor.subscribe();

    let task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(&device).await })
    };
    state_rx
        .wait_for(|s| s.name() == "negotiating")
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.disconnect().await;
    let result = task.await.unwrap();

    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected { reason: None });

    // The adapter notices the closed channel once its delayed answer fails
    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(transport.active_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_all_strategies_fail() {
    let sim = unpaired()
        .failing(ConnectStrategy::Insecure)
        .failing(ConnectStrategy::Secure)
        .failing(ConnectStrategy::DirectChannel);
    let (supervisor, _transport, device) = setup(sim);

    let err = supervisor.connect(&device).await.unwrap_err();
    match &err {
        EngineError::ConnectionStrategyFailed { device: id, failures } => {
            assert_eq!(id, UNPAIRED_ID);
            let tried: Vec<_> = failures.iter().map(|f| f.strategy).collect();
            assert_eq!(
                tried,
                vec![
                    ConnectStrategy::Insecure,
                    ConnectStrategy::Secure,
                    ConnectStrategy::DirectChannel
                ]
            );
        }
        other => panic!("unexpected error: {}", other),
    }
    // The message names every strategy tried
    let message = err.to_string();
    assert!(message.contains("insecure"), "{}", message);
    assert!(message.contains("secure"), "{}", message);
    assert!(supervisor.state().is_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_attempts_exhausted_until_reset() {
    let sim = unpaired()
        .failing(ConnectStrategy::Insecure)
        .failing(ConnectStrategy::Secure)
        .failing(ConnectStrategy::DirectChannel);
    let (supervisor, transport, device) = setup(sim);

    for _ in 0..3 {
        assert!(matches!(
            supervisor.connect(&device).await,
            Err(EngineError::ConnectionStrategyFailed { .. })
        ));
    }
    assert_eq!(supervisor.attempts(UNPAIRED_ID).await, 3);

    let opens_before = transport.open_log().await.len();
    match supervisor.connect(&device).await {
        Err(EngineError::AttemptsExhausted { device, attempts }) => {
            assert_eq!(device, UNPAIRED_ID);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result: {:?}", other.err()),
    }
    // No strategy was tried for the rejected call
    assert_eq!(transport.open_log().await.len(), opens_before);

    supervisor.reset_attempts(UNPAIRED_ID).await;
    assert_eq!(supervisor.attempts(UNPAIRED_ID).await, 0);
    assert!(matches!(
        supervisor.connect(&device).await,
        Err(EngineError::ConnectionStrategyFailed { .. })
    ));
    assert_eq!(supervisor.attempts(UNPAIRED_ID).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_are_per_device() {
    let broken = unpaired()
        .failing(ConnectStrategy::Insecure)
        .failing(ConnectStrategy::Secure)
        .failing(ConnectStrategy::DirectChannel);
    let working = paired();
    let (broken_device, working_device) = (device(&broken), device(&working));
    let transport = Arc::new(SimTransport::new(vec![broken, working]));
    let supervisor = ConnectionSupervisor::new(transport);

    for _ in 0..3 {
        let _ = supervisor.connect(&broken_device).await;
    }
    assert!(matches!(
        supervisor.connect(&broken_device).await,
        Err(EngineError::AttemptsExhausted { .. })
    ));

    supervisor.connect(&working_device).await.unwrap();
    assert!(supervisor.state().is_ready());
    assert_eq!(supervisor.attempts(PAIRED_ID).await, 0);
    assert_eq!(supervisor.attempts(UNPAIRED_ID).await, 3);

    supervisor.reset_all_attempts().await;
    assert_eq!(supervisor.attempts(UNPAIRED_ID).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_unavailable_is_immediate() {
    let sim = paired();
    let device = device(&sim);
    let transport = Arc::new(SimTransport::new(vec![sim]).powered_off());
    let supervisor = ConnectionSupervisor::new(transport.clone());

    let err = supervisor.connect(&device).await.unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert!(transport.open_log().await.is_empty());
    assert!(supervisor.state().is_disconnected());

    // Scanning still returns a (empty) list
    let devices = supervisor.scan(Duration::from_secs(1)).await.unwrap();
    assert!(devices.is_empty());
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_negotiation_rejects_lower_codes_in_order() {
    let adapter = VirtualElm327Config {
        auto_search: false,
        ..VirtualElm327Config::on_protocol(ObdProtocol::Can11Bit500k)
    };
    let mut config = EngineConfig::default();
    config.negotiation.candidates = ObdProtocol::ALL.to_vec();
    let (supervisor, transport, device) = setup_with_config(paired().with_adapter(adapter), config);

    supervisor.connect(&device).await.unwrap();

    let protocol = supervisor.negotiated_protocol().unwrap();
    assert_eq!(protocol.code, 6);
    assert!(!protocol.automatic);

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    let selections: Vec<String> = adapter
        .lock()
        .await
        .history()
        .iter()
        .filter(|c| c.starts_with("ATSP"))
        .cloned()
        .collect();
    assert_eq!(
        selections,
        vec!["ATSP0", "ATSP1", "ATSP2", "ATSP3", "ATSP4", "ATSP5", "ATSP6"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_failure_closes_channel() {
    let (supervisor, transport, device) =
        setup(paired().with_adapter(VirtualElm327Config::without_vehicle()));

    let err = supervisor.connect(&device).await.unwrap_err();
    match &err {
        EngineError::NegotiationFailed { tried } => {
            assert_eq!(&tried[..ObdProtocol::PRIORITY.len()], &ObdProtocol::PRIORITY[..]);
            assert_eq!(tried.last(), Some(&ObdProtocol::Automatic));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("no compatible protocol"));

    // Only one device and one channel were tried
    assert_eq!(transport.open_log().await.len(), 1);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.active_links(), 0);
    assert!(disconnect_reason(&supervisor.state())
        .unwrap()
        .contains("no compatible protocol"));
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_commands_rejected_when_not_ready() {
    let (supervisor, _transport, _device) = setup(paired());

    let err = supervisor
        .send_command("010C", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotReady("idle")));

    let rpm = standard::get(standard::ENGINE_RPM).unwrap();
    assert!(matches!(
        supervisor.read_pid(&rpm).await,
        Err(EngineError::NotReady(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_read_pid_decodes_rpm() {
    let (supervisor, _transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let rpm = standard::get(standard::ENGINE_RPM).unwrap();
    let value = supervisor.read_pid(&rpm).await.unwrap();
    assert_eq!(value.as_f64(), Some(1726.0));
    assert_eq!(value.unit, "rpm");

    let raw = supervisor
        .send_command("0100", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(raw, "4100BE3FA813");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_commands_keep_order() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let speed = standard::get(standard::VEHICLE_SPEED).unwrap();
    let coolant = standard::get(standard::COOLANT_TEMPERATURE).unwrap();
    let (a, b, c) = tokio::join!(
        supervisor.send_command("010C", Duration::from_secs(1)),
        supervisor.read_pid(&speed),
        supervisor.read_pid(&coolant),
    );
    assert_eq!(a.unwrap(), "410C1AF8");
    assert_eq!(b.unwrap().as_f64(), Some(40.0));
    assert_eq!(c.unwrap().as_f64(), Some(83.0));

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    let history = adapter.lock().await.history().to_vec();
    let tail: Vec<&str> = history.iter().rev().take(3).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["010C", "010D", "0105"]);
}

#[tokio::test(start_paused = true)]
async fn test_traffic_events() {
    let (supervisor, _transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();
    let mut events = supervisor.events();

    supervisor
        .send_command("010D", Duration::from_secs(1))
        .await
        .unwrap();

    let traffic: Vec<LinkEvent> = drain(&mut events)
        .into_iter()
        .filter(LinkEvent::is_traffic)
        .collect();
    assert!(matches!(&traffic[0], LinkEvent::DataOut { text } if text == "010D"));
    assert!(matches!(&traffic[1], LinkEvent::DataIn { text } if text.contains("410D28")));
}

// ============================================================================
// Disconnect and Health
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (supervisor, transport, device) = setup(paired());

    supervisor.disconnect().await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected { reason: None });

    supervisor.connect(&device).await.unwrap();
    let mut events = supervisor.events();

    supervisor.disconnect().await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected { reason: None });
    supervisor.disconnect().await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected { reason: None });

    let disconnects = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, LinkEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.active_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_command_rejected_on_disconnect() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();
    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    adapter.lock().await.set_silent(true);

    let pending = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .send_command("010C", Duration::from_secs(30))
                .await
        })
    };
    sleep(Duration::from_secs(1)).await;
    supervisor.disconnect().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(EngineError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_health_failures_degrade_then_disconnect() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();
    let mut events = supervisor.events();

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    adapter.lock().await.set_silent(true);

    // First probe at 5s times out after 2s
    sleep(Duration::from_secs(8)).await;
    match supervisor.state() {
        ConnectionState::Degraded { quality, reason, .. } => {
            assert_eq!(quality, LinkQuality::Poor);
            assert!(reason.contains("timed out"), "{}", reason);
        }
        other => panic!("expected degraded, got {:?}", other),
    }

    // Second consecutive failure drops the link
    sleep(Duration::from_secs(5)).await;
    assert!(supervisor.state().is_disconnected());
    assert!(disconnect_reason(&supervisor.state()).is_some());

    let events = drain(&mut events);
    let failed_probes = events
        .iter()
        .filter(|e| matches!(e, LinkEvent::HealthProbe { ok: false, .. }))
        .count();
    assert_eq!(failed_probes, 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, LinkEvent::Disconnected { device_id, .. } if device_id == PAIRED_ID)));
}

#[tokio::test(start_paused = true)]
async fn test_health_failure_age_disconnects() {
    let mut config = EngineConfig::default();
    config.health.max_consecutive_failures = 10;
    config.health.max_failure_age_ms = 8_000;
    let (supervisor, transport, device) = setup_with_config(paired(), config);
    supervisor.connect(&device).await.unwrap();
    let mut events = supervisor.events();

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    adapter.lock().await.set_silent(true);

    // 7s without an answer is still inside the allowed age
    sleep(Duration::from_secs(8)).await;
    assert_eq!(supervisor.state().name(), "degraded");

    // The second failure lands past 8s and ends the session
    sleep(Duration::from_secs(5)).await;
    assert!(supervisor.state().is_disconnected());

    let failed_checks = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, LinkEvent::HealthProbe { ok: false, .. }))
        .count();
    assert_eq!(failed_checks, 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_recovers_from_single_failure() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    adapter.lock().await.set_silent(true);
    sleep(Duration::from_secs(8)).await;
    assert_eq!(supervisor.state().name(), "degraded");

    // Degraded still accepts commands
    assert!(supervisor.state().accepts_commands());

    adapter.lock().await.set_silent(false);
    sleep(Duration::from_secs(5)).await;
    assert!(supervisor.state().is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_is_detected() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();
    let mut state_rx = supervisor.subscribe();

    assert!(transport.drop_link(PAIRED_ID).await);
    let state = state_rx
        .wait_for(|s| s.is_disconnected())
        .await
        .unwrap()
        .clone();

    assert!(disconnect_reason(&state).unwrap().contains("connection lost"));
    assert!(matches!(
        supervisor
            .send_command("010C", Duration::from_secs(1))
            .await,
        Err(EngineError::NotReady("disconnected"))
    ));
    assert_eq!(supervisor.active_strategy().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_link_loss() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();
    transport.drop_link(PAIRED_ID).await;
    sleep(Duration::from_millis(50)).await;
    assert!(supervisor.state().is_disconnected());

    supervisor.connect(&device).await.unwrap();
    assert!(supervisor.state().is_ready());
}

// ============================================================================
// Scanning
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scan_ranks_and_filters() {
    let transport = Arc::new(SimTransport::demo());
    let supervisor = ConnectionSupervisor::new(transport);
    let mut states = supervisor.events();

    let devices = supervisor.scan(Duration::from_secs(1)).await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, PAIRED_ID);
    assert!(devices
        .windows(2)
        .all(|w| w[0].compatibility_score >= w[1].compatibility_score));
    assert!(devices.iter().all(|d| !d.display_name.contains("JBL")));

    assert_eq!(supervisor.state(), ConnectionState::Idle);
    assert_eq!(state_names(&drain(&mut states)), vec!["scanning", "idle"]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_rejected_while_connecting() {
    let (supervisor, _transport, device) = setup(paired().hanging(ConnectStrategy::Secure));

    let task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(&device).await })
    };
    sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        supervisor.scan(Duration::from_secs(1)).await,
        Err(EngineError::Busy(_))
    ));

    supervisor.disconnect().await;
    assert!(matches!(task.await.unwrap(), Err(EngineError::Cancelled)));
    assert!(supervisor.scan(Duration::from_millis(500)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_scan_while_ready_keeps_state() {
    let (supervisor, _transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let devices = supervisor.scan(Duration::from_millis(500)).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(supervisor.state().is_ready());
}

// ============================================================================
// Diagnostics
// ============================================================================

fn codes(list: &[obd_protocol::Dtc]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

#[tokio::test(start_paused = true)]
async fn test_read_and_clear_trouble_codes() {
    let (supervisor, _transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let stored = supervisor.read_dtcs().await.unwrap();
    assert_eq!(codes(&stored), vec!["P0133", "U0100"]);
    let pending = supervisor.read_pending_dtcs().await.unwrap();
    assert_eq!(codes(&pending), vec!["P0171"]);

    supervisor.clear_dtcs().await.unwrap();
    assert!(supervisor.read_dtcs().await.unwrap().is_empty());
    assert!(supervisor.read_pending_dtcs().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_trouble_codes_on_older_bus() {
    let adapter = VirtualElm327Config::on_protocol(ObdProtocol::Iso9141);
    let (supervisor, _transport, device) = setup(paired().with_adapter(adapter));
    supervisor.connect(&device).await.unwrap();

    let stored = supervisor.read_dtcs().await.unwrap();
    assert_eq!(codes(&stored), vec!["P0133", "U0100"]);
    assert_eq!(
        supervisor.read_vin().await.unwrap(),
        "1D4GP00R55B123456"
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_vin_multi_frame() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    assert_eq!(supervisor.read_vin().await.unwrap(), "1D4GP00R55B123456");
    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    assert_eq!(adapter.lock().await.history().last().map(String::as_str), Some("0902"));
}

#[tokio::test(start_paused = true)]
async fn test_supported_pids_follow_bitmap_chain() {
    let (supervisor, transport, device) = setup(paired());
    supervisor.connect(&device).await.unwrap();

    let pids = supervisor.supported_pids().await.unwrap();
    for pid in [0x01u16, 0x0C, 0x0D, 0x20, 0x21, 0x2F, 0x40, 0x42, 0x46] {
        assert!(pids.contains(&pid), "missing {:02X} in {:02X?}", pid, pids);
    }
    assert!(!pids.contains(&0x60));

    let adapter = transport.adapter(PAIRED_ID).await.unwrap();
    let history = adapter.lock().await.history().to_vec();
    let tail: Vec<&str> = history.iter().rev().take(3).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["0100", "0120", "0140"]);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_need_a_connection() {
    let (supervisor, _transport, _device) = setup(paired());
    assert!(matches!(supervisor.read_dtcs().await, Err(EngineError::NotReady(_))));
    assert!(matches!(supervisor.read_vin().await, Err(EngineError::NotReady(_))));
    assert!(matches!(
        supervisor.supported_pids().await,
        Err(EngineError::NotReady(_))
    ));
}
