//! OBD2 Adapter Simulation Library
//!
//! This crate provides a simulation layer for exercising the adapter engine
//! without a vehicle or a real adapter:
//!
//! - **VirtualElm327**: answers AT commands and PID requests like an ELM327
//! - **SimTransport**: a [`Transport`](obd_detect::Transport) whose devices
//!   are virtual adapters, with scripted strategy failures and hangs
//!
//! # Example
//!
//! ```rust
//! use obd_sim::VirtualElm327;
//!
//! let mut adapter = VirtualElm327::default();
//! adapter.process_line("ATE0");
//! adapter.process_line("ATL0");
//! adapter.process_line("ATSP6");
//!
//! let reply = adapter.process_line("010C").unwrap();
//! assert!(reply.starts_with("41 0C 1A F8"));
//! ```

pub mod adapter;
pub mod adapter_task;
pub mod transport;

pub use adapter::{VirtualElm327, VirtualElm327Config};
pub use adapter_task::{run_virtual_adapter_task, SharedAdapter, VirtualAdapterCommand};
pub use transport::{OpenOutcome, OpenRecord, SimDevice, SimTransport};
