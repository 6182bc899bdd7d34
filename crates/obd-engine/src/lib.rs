//! OBD2 Adapter Engine
//!
//! This crate turns a [`Transport`](obd_detect::Transport) channel into a
//! supervised diagnostic session with an ELM327-class adapter.
//!
//! # Architecture
//!
//! - **ConnectionSupervisor**: owns the state machine, walks connection
//!   strategies, runs the health monitor and exposes the public surface
//!   (`scan`, `connect`, `disconnect`, `send_command`, `read_pid`)
//! - **ProtocolNegotiator**: resets and configures the adapter, then picks
//!   the bus protocol the vehicle answers on
//! - **CommandPipeline**: single-flight FIFO command execution with
//!   per-command timeouts
//!
//! State changes are published on a `watch` channel; traffic and
//! milestones go out as [`LinkEvent`]s on a broadcast channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use obd_engine::ConnectionSupervisor;
//! use obd_protocol::pid::standard;
//! use obd_sim::SimTransport;
//!
//! # async fn run() -> obd_engine::Result<()> {
//! let supervisor = ConnectionSupervisor::new(Arc::new(SimTransport::demo()));
//! let devices = supervisor.scan(Duration::from_secs(2)).await?;
//! supervisor.connect(&devices[0]).await?;
//!
//! if let Some(rpm) = standard::get(standard::ENGINE_RPM) {
//!     println!("{}", supervisor.read_pid(&rpm).await?);
//! }
//! supervisor.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod pipeline;
pub mod state;
pub mod supervisor;

pub use config::{
    ConnectConfig, EngineConfig, HealthConfig, NegotiatorConfig, PipelineConfig,
};
pub use error::{CommandError, EngineError, Result, StrategyFailure};
pub use events::LinkEvent;
pub use negotiator::{NegotiationOutcome, ProtocolNegotiator};
pub use pipeline::{CommandPipeline, PipelineStatus};
pub use state::{ConnectionState, LinkQuality, NegotiatedProtocol};
pub use supervisor::{strategy_order, ConnectionSupervisor};
