//! Subcommand implementations

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use obd_detect::{Device, RawDevice};
use obd_engine::{ConnectionState, ConnectionSupervisor};
use obd_protocol::pid::{standard, MODE_CURRENT_DATA, MODE_READ_BY_IDENTIFIER};
use obd_protocol::{Dtc, PidDefinition};
use tokio::time::sleep;
use tracing::info;

/// Turn a PID argument into a definition
///
/// Accepts a standard PID (`0C`), a mode 01 request (`010C`) or a mode 22
/// request (`22D40C`). Unknown PIDs decode as raw hex.
pub fn parse_pid(arg: &str) -> Result<PidDefinition> {
    let text: String = arg
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{}' is not a hex PID", arg);
    }

    let hex = |s: &str| u16::from_str_radix(s, 16).map_err(|e| anyhow!("'{}': {}", arg, e));
    match text.len() {
        2 => {
            let pid = hex(&text)?;
            Ok(standard::get(pid)
                .unwrap_or_else(|| PidDefinition::raw(format!("PID {}", text), MODE_CURRENT_DATA, pid)))
        }
        4 if text.starts_with("01") => {
            let pid = hex(&text[2..])?;
            Ok(standard::by_command(&text)
                .unwrap_or_else(|| PidDefinition::raw(format!("PID {}", text), MODE_CURRENT_DATA, pid)))
        }
        6 if text.starts_with("22") => {
            let pid = hex(&text[2..])?;
            Ok(PidDefinition::raw(format!("DID {}", &text[2..]), MODE_READ_BY_IDENTIFIER, pid))
        }
        _ => bail!("'{}': expected PID (0C), mode 01 request (010C) or mode 22 request (22D40C)", arg),
    }
}

fn find<'a>(devices: &'a [Device], wanted: &str) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.id == wanted || d.display_name.eq_ignore_ascii_case(wanted))
}

/// Pick the device to connect to
///
/// An explicit request wins, then the last device that reached ready, then
/// the best scan result.
pub async fn resolve_device(
    supervisor: &ConnectionSupervisor,
    requested: Option<&str>,
    last: Option<&str>,
    window: Duration,
) -> Result<Device> {
    let devices = supervisor.scan(window).await?;

    if let Some(wanted) = requested {
        if let Some(device) = find(&devices, wanted) {
            return Ok(device.clone());
        }
        // Ports the scan filtered out can still be opened by name
        info!("{} not found by scan; trying it directly", wanted);
        return Ok(Device::from_raw(&RawDevice::paired(wanted, wanted)));
    }

    if let Some(device) = last.and_then(|last| find(&devices, last)) {
        info!("Using last connected device {}", device.id);
        return Ok(device.clone());
    }

    devices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no OBD2 adapters found; pair the adapter or pass --port"))
}

pub async fn connect(supervisor: &ConnectionSupervisor, device: &Device) -> Result<()> {
    supervisor
        .connect(device)
        .await
        .with_context(|| format!("Failed to connect to {} ({})", device.display_name, device.id))?;

    let protocol = supervisor
        .negotiated_protocol()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".into());
    println!("Connected to {} ({})", device.display_name, device.id);
    if let Some(strategy) = supervisor.active_strategy().await {
        println!("  strategy: {}", strategy);
    }
    if let Some(version) = supervisor.adapter_version().await {
        println!("  adapter:  {}", version);
    }
    println!("  protocol: {}", protocol);
    Ok(())
}

pub async fn scan(supervisor: &ConnectionSupervisor, window: Duration) -> Result<()> {
    let devices = supervisor.scan(window).await?;
    if devices.is_empty() {
        println!("No OBD2 adapters found");
        return Ok(());
    }

    println!(
        "{:<20} {:<28} {:>5}  {:<6}  {:<11} {}",
        "ID", "NAME", "SCORE", "PAIRED", "KIND", "SIGNAL"
    );
    for device in devices {
        println!(
            "{:<20} {:<28} {:>5}  {:<6}  {:<11} {}",
            device.id,
            device.display_name,
            device.compatibility_score,
            if device.is_paired { "yes" } else { "no" },
            format!("{:?}", device.kind_guess),
            device
                .signal_strength
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

/// Print state changes until `duration` passes, the link drops or Ctrl-C
pub async fn watch(supervisor: &ConnectionSupervisor, duration: Duration) -> Result<()> {
    let mut states = supervisor.subscribe();
    let deadline = sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = states.borrow_and_update().clone();
                match &state {
                    ConnectionState::Degraded { reason, quality, .. } => {
                        println!("degraded ({:?}): {}", quality, reason);
                    }
                    ConnectionState::Disconnected { reason } => {
                        println!("disconnected: {}", reason.as_deref().unwrap_or("closed"));
                        return Ok(());
                    }
                    other => println!("{}", other.name()),
                }
            }
        }
    }
}

pub async fn read(
    supervisor: &ConnectionSupervisor,
    pids: &[PidDefinition],
    count: u32,
    interval: Duration,
) -> Result<()> {
    for round in 0..count.max(1) {
        for pid in pids {
            match supervisor.read_pid(pid).await {
                Ok(value) => println!("{:<36} {}", pid.to_string(), value),
                Err(e) => println!("{:<36} error: {}", pid.to_string(), e),
            }
        }
        if round + 1 < count {
            sleep(interval).await;
        }
    }
    Ok(())
}

pub async fn send(supervisor: &ConnectionSupervisor, command: &str, timeout: Duration) -> Result<()> {
    let response = supervisor
        .send_command(command, timeout)
        .await
        .with_context(|| format!("{} failed", command))?;
    println!("{}", response);
    Ok(())
}

pub async fn dtcs(supervisor: &ConnectionSupervisor, pending: bool) -> Result<()> {
    let (kind, codes) = if pending {
        ("pending", supervisor.read_pending_dtcs().await)
    } else {
        ("stored", supervisor.read_dtcs().await)
    };
    let codes = codes.with_context(|| format!("Reading {} trouble codes failed", kind))?;
    if codes.is_empty() {
        println!("No {} trouble codes", kind);
        return Ok(());
    }
    for line in describe_codes(&codes) {
        println!("{}", line);
    }
    Ok(())
}

fn describe_codes(codes: &[Dtc]) -> Vec<String> {
    codes
        .iter()
        .map(|code| format!("{:<6} {}", code.to_string(), code.category()))
        .collect()
}

pub async fn clear_dtcs(supervisor: &ConnectionSupervisor) -> Result<()> {
    supervisor
        .clear_dtcs()
        .await
        .context("Clearing trouble codes failed")?;
    println!("Trouble codes cleared");
    Ok(())
}

pub async fn vin(supervisor: &ConnectionSupervisor) -> Result<()> {
    let vin = supervisor.read_vin().await.context("Reading the VIN failed")?;
    println!("{}", vin);
    Ok(())
}

pub async fn supported(supervisor: &ConnectionSupervisor) -> Result<()> {
    let pids = supervisor
        .supported_pids()
        .await
        .context("PID discovery failed")?;
    for pid in pids {
        let name = standard::get(pid)
            .map(|def| def.name)
            .unwrap_or_else(|| "-".to_string());
        println!("01{:02X}  {}", pid, name);
    }
    Ok(())
}

pub fn pids() {
    for pid in standard::all() {
        let formula = pid
            .formula
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "raw".into());
        println!("{:<6} {:<36} {:<16} {}", pid.command(), pid.name, formula, pid.unit);
    }
}
