//! PID definitions
//!
//! A PID definition names one measurement: the diagnostic mode, the
//! parameter id, how to convert response bytes, and the unit. Manufacturer
//! catalogues (mode `22`) use 16-bit PIDs; standard mode `01` PIDs are 8-bit.

use std::fmt;

use crate::error::FormulaError;
use crate::formula::Formula;

/// Mode 01, current powertrain data
pub const MODE_CURRENT_DATA: u8 = 0x01;

/// Mode 22, read data by identifier (manufacturer PIDs)
pub const MODE_READ_BY_IDENTIFIER: u8 = 0x22;

/// Mode 03, stored trouble codes
pub const MODE_STORED_DTCS: u8 = 0x03;

/// Mode 04, clear trouble codes and freeze frame data
pub const MODE_CLEAR_DTCS: u8 = 0x04;

/// Mode 07, pending trouble codes
pub const MODE_PENDING_DTCS: u8 = 0x07;

/// Mode 09, vehicle information
pub const MODE_VEHICLE_INFO: u8 = 0x09;

/// Mode 09 info type carrying the VIN
pub const INFO_TYPE_VIN: u8 = 0x02;

/// Offset added to the mode byte in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// First byte of a negative response, followed by the rejected mode
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Bytes of PID that follow the mode in a request and its answer
pub fn pid_width_for_mode(mode: u8) -> usize {
    match mode {
        MODE_STORED_DTCS | MODE_CLEAR_DTCS | MODE_PENDING_DTCS | 0x0A => 0,
        MODE_READ_BY_IDENTIFIER => 2,
        _ => 1,
    }
}

/// One requestable measurement
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PidDefinition {
    pub name: String,
    pub mode: u8,
    pub pid: u16,
    /// Conversion formula; `None` means the value is returned as raw hex
    pub formula: Option<Formula>,
    pub unit: String,
}

impl PidDefinition {
    pub fn new(
        name: impl Into<String>,
        mode: u8,
        pid: u16,
        formula: &str,
        unit: impl Into<String>,
    ) -> Result<Self, FormulaError> {
        Ok(Self {
            name: name.into(),
            mode,
            pid,
            formula: Some(formula.parse()?),
            unit: unit.into(),
        })
    }

    /// A definition without a known conversion
    pub fn raw(name: impl Into<String>, mode: u8, pid: u16) -> Self {
        Self {
            name: name.into(),
            mode,
            pid,
            formula: None,
            unit: "raw".into(),
        }
    }

    /// Width of the PID field in bytes
    pub fn pid_width(&self) -> usize {
        if self.mode == MODE_READ_BY_IDENTIFIER || self.pid > 0xFF {
            2
        } else {
            1
        }
    }

    /// Request text, e.g. `010C` or `22D40C`
    pub fn command(&self) -> String {
        match self.pid_width() {
            1 => format!("{:02X}{:02X}", self.mode, self.pid),
            _ => format!("{:02X}{:04X}", self.mode, self.pid),
        }
    }

    /// Bytes a positive response starts with, e.g. `41 0C`
    pub fn response_prefix(&self) -> Vec<u8> {
        let mut prefix = vec![self.mode.wrapping_add(POSITIVE_RESPONSE_OFFSET)];
        if self.pid_width() == 2 {
            prefix.extend_from_slice(&self.pid.to_be_bytes());
        } else {
            prefix.push(self.pid as u8);
        }
        prefix
    }
}

impl fmt::Display for PidDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.command())
    }
}

/// Standard mode 01 PIDs
pub mod standard {
    use super::{PidDefinition, MODE_CURRENT_DATA};

    /// (pid, name, formula, unit); an empty formula means raw
    const TABLE: &[(u16, &str, &str, &str)] = &[
        (0x00, "Supported PIDs 01-20", "", "raw"),
        (0x04, "Calculated engine load", "A*100/255", "%"),
        (0x05, "Engine coolant temperature", "A-40", "°C"),
        (0x0B, "Intake manifold pressure", "A", "kPa"),
        (0x0C, "Engine RPM", "(A*256+B)/4", "rpm"),
        (0x0D, "Vehicle speed", "A", "km/h"),
        (0x0F, "Intake air temperature", "A-40", "°C"),
        (0x10, "MAF air flow rate", "(A*256+B)/100", "g/s"),
        (0x11, "Throttle position", "A*100/255", "%"),
        (0x2F, "Fuel tank level", "A*100/255", "%"),
        (0x42, "Control module voltage", "(A*256+B)/1000", "V"),
        (0x46, "Ambient air temperature", "A-40", "°C"),
    ];

    pub const SUPPORTED_PIDS: u16 = 0x00;
    pub const COOLANT_TEMPERATURE: u16 = 0x05;
    pub const ENGINE_RPM: u16 = 0x0C;
    pub const VEHICLE_SPEED: u16 = 0x0D;

    fn build(pid: u16, name: &str, formula: &str, unit: &str) -> Option<PidDefinition> {
        if formula.is_empty() {
            return Some(PidDefinition::raw(name, MODE_CURRENT_DATA, pid));
        }
        PidDefinition::new(name, MODE_CURRENT_DATA, pid, formula, unit).ok()
    }

    /// Look up a standard mode 01 PID
    pub fn get(pid: u16) -> Option<PidDefinition> {
        TABLE
            .iter()
            .find(|(p, ..)| *p == pid)
            .and_then(|(p, name, formula, unit)| build(*p, name, formula, unit))
    }

    /// All standard definitions
    pub fn all() -> Vec<PidDefinition> {
        TABLE
            .iter()
            .filter_map(|(p, name, formula, unit)| build(*p, name, formula, unit))
            .collect()
    }

    /// Find a standard PID by its request text (`010C`)
    pub fn by_command(command: &str) -> Option<PidDefinition> {
        let command = command.trim();
        let mode = command.get(..2).and_then(|m| u8::from_str_radix(m, 16).ok())?;
        let pid = command.get(2..).and_then(|p| u16::from_str_radix(p, 16).ok())?;
        if mode != MODE_CURRENT_DATA {
            return None;
        }
        get(pid)
    }
}
