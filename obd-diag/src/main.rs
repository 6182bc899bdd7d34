//! OBD2 Diagnostics CLI
//!
//! Scans for ELM327-class adapters, connects, and reads PIDs or sends raw
//! commands. `--simulate` swaps serial ports for virtual adapters.

mod commands;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use obd_detect::{SerialTransport, Transport};
use obd_engine::{ConnectionSupervisor, LinkEvent};
use obd_sim::SimTransport;
use settings::Settings;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "obd-diag")]
#[command(author, version, about = "OBD2 adapter diagnostics")]
#[command(propagate_version = true)]
struct Cli {
    /// Use simulated adapters instead of serial ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Adapter port or device id (skips automatic selection)
    #[arg(short, long, env = "OBD_PORT", global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, env = "OBD_BAUD", global = true)]
    baud: Option<u32>,

    /// Settings file path
    #[arg(short, long, env = "OBD_DIAG_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print every line sent to and received from the adapter
    #[arg(long, global = true)]
    trace_traffic: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate adapters, best match first
    Scan {
        /// Discovery window in seconds
        #[arg(short, long)]
        window: Option<u64>,
    },

    /// Connect, negotiate a protocol and report the result
    Connect {
        /// Device id or name
        device: Option<String>,

        /// Keep the connection open and report state changes for this many seconds
        #[arg(long, default_value = "0")]
        watch: u64,
    },

    /// Read one or more PIDs (0C, 010C, 22D40C)
    Read {
        #[arg(required = true)]
        pids: Vec<String>,

        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,

        /// Number of rounds
        #[arg(long, default_value = "1")]
        count: u32,

        /// Pause between rounds in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Send a raw command (AT or OBD request)
    Send {
        command: String,

        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,

        /// Response timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Read stored trouble codes
    Dtcs {
        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,

        /// Read pending codes (mode 07) instead
        #[arg(long)]
        pending: bool,
    },

    /// Clear stored trouble codes and turn off the check-engine light
    ClearDtcs {
        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Read the vehicle identification number
    Vin {
        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,
    },

    /// List the mode 01 PIDs the vehicle supports
    Supported {
        /// Device id or name
        #[arg(short, long)]
        device: Option<String>,
    },

    /// List the built-in standard PIDs
    Pids,

    /// Show the effective settings
    Config {
        /// Write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("obd_diag=debug,obd_engine=debug,obd_detect=debug,obd_protocol=debug,obd_sim=debug")
        } else {
            EnvFilter::new("obd_diag=info,obd_engine=info,obd_detect=warn,obd_protocol=warn,obd_sim=warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Print traffic and remember the last device that reached ready
fn spawn_event_listener(
    mut events: broadcast::Receiver<LinkEvent>,
    mut settings: Settings,
    path: Option<PathBuf>,
    trace_traffic: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event listener skipped {} event(s)", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            match event {
                LinkEvent::DataOut { text } if trace_traffic => eprintln!(">> {}", text),
                LinkEvent::DataIn { text } if trace_traffic => {
                    eprintln!("<< {}", text.replace('\r', "\\r").replace('\n', "\\n"))
                }
                LinkEvent::Connected { device_id, .. } => {
                    let Some(path) = &path else { continue };
                    settings.last_device = Some(device_id);
                    if let Err(e) = settings.save_to(path) {
                        warn!("Could not remember the last device: {:#}", e);
                    }
                }
                _ => {}
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = cli.config.clone().or_else(Settings::default_path);
    let mut settings = match &path {
        Some(path) => Settings::load_from(path)?,
        None => Settings::default(),
    };
    if let Some(baud) = cli.baud {
        settings.serial.baud_rate = baud;
    }

    match &cli.command {
        Commands::Pids => {
            commands::pids();
            return Ok(());
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if *save {
                if let Some(path) = &path {
                    settings.save_to(path)?;
                    println!("Saved to {}", path.display());
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let transport: Arc<dyn Transport> = if cli.simulate {
        info!("Using simulated adapters");
        Arc::new(SimTransport::demo())
    } else {
        Arc::new(SerialTransport::with_config(settings.serial.clone()))
    };
    let supervisor = ConnectionSupervisor::with_config(transport, settings.engine.clone());

    // Simulated ids are not worth remembering
    let persist_path = if cli.simulate { None } else { path.clone() };
    let listener = spawn_event_listener(
        supervisor.events(),
        settings.clone(),
        persist_path,
        cli.trace_traffic,
    );

    let window = Duration::from_secs(settings.scan_window_secs);
    let last = settings.last_device.as_deref();
    let port = cli.port.as_deref();

    let result = match &cli.command {
        Commands::Scan { window: secs } => {
            commands::scan(&supervisor, secs.map(Duration::from_secs).unwrap_or(window)).await
        }
        Commands::Connect { device, watch } => {
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            if *watch > 0 {
                commands::watch(&supervisor, Duration::from_secs(*watch)).await
            } else {
                Ok(())
            }
        }
        Commands::Read {
            pids,
            device,
            count,
            interval_ms,
        } => {
            let pids = pids
                .iter()
                .map(|arg| commands::parse_pid(arg))
                .collect::<Result<Vec<_>>>()?;
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::read(&supervisor, &pids, *count, Duration::from_millis(*interval_ms)).await
        }
        Commands::Send {
            command,
            device,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| settings.engine.pipeline.default_timeout());
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::send(&supervisor, command, timeout).await
        }
        Commands::Dtcs { device, pending } => {
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::dtcs(&supervisor, *pending).await
        }
        Commands::ClearDtcs { device } => {
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::clear_dtcs(&supervisor).await
        }
        Commands::Vin { device } => {
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::vin(&supervisor).await
        }
        Commands::Supported { device } => {
            let requested = device.as_deref().or(port);
            let device = commands::resolve_device(&supervisor, requested, last, window).await?;
            commands::connect(&supervisor, &device).await?;
            commands::supported(&supervisor).await
        }
        Commands::Pids | Commands::Config { .. } => Ok(()),
    };

    supervisor.disconnect().await;
    // Dropping the supervisor closes the event stream once the listener drains it
    drop(supervisor);
    if tokio::time::timeout(Duration::from_secs(1), listener).await.is_err() {
        warn!("Event listener did not stop");
    }
    result
}
