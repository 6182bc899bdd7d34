//! OBD2 Protocol Library
//!
//! This crate provides the wire-level pieces needed to talk to an
//! ELM327-class diagnostic adapter:
//!
//! - **Framing**: prompt-terminated response splitting, echo and
//!   informational-line removal, adapter error detection
//! - **Protocols**: the OBD2 bus protocols selectable with `ATSPn`
//! - **PIDs**: mode/PID definitions with conversion formulas
//! - **Parsing**: turning a response into a typed value, plus trouble
//!   codes, supported-PID bitmaps and the VIN
//!
//! # Example
//!
//! ```rust
//! use obd_protocol::{pid::standard, ResponseParser, ResponseFramer, clean_response};
//!
//! let mut framer = ResponseFramer::new();
//! framer.push_bytes(b"010C\r41 0C 1A F8\r\r>");
//!
//! let frame = framer.next_response().unwrap();
//! let text = clean_response(&frame, "010C");
//! assert_eq!(text, "41 0C 1A F8");
//!
//! let rpm = standard::get(standard::ENGINE_RPM).unwrap();
//! let value = ResponseParser::parse(&rpm, &text).unwrap();
//! assert_eq!(value.as_f64(), Some(1726.0));
//! ```

pub mod dtc;
pub mod elm;
pub mod error;
pub mod formula;
pub mod parser;
pub mod pid;
pub mod protocol;

pub use dtc::{Dtc, DtcCategory};
pub use elm::{adapter_error, clean_lines, clean_response, is_hex_payload, ResponseFramer};
pub use error::{FormulaError, ParseError};
pub use formula::Formula;
pub use parser::{ParsedValue, ResponseParser, Value};
pub use pid::PidDefinition;
pub use protocol::ObdProtocol;
