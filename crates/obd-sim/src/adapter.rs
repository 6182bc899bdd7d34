//! Virtual ELM327 adapter
//!
//! Answers AT commands, mode 01/22 requests, trouble code reads and clears,
//! and the VIN the way a real adapter does, including echo, spacing, CAN
//! headers, multi-frame answers and the `>` prompt. The simulated
//! vehicle only answers on the bus protocols listed in its configuration, so
//! protocol negotiation can be exercised end to end.

use std::collections::BTreeMap;
use std::time::Duration;

use obd_protocol::pid::{
    INFO_TYPE_VIN, MODE_CLEAR_DTCS, MODE_PENDING_DTCS, MODE_STORED_DTCS, MODE_VEHICLE_INFO,
    POSITIVE_RESPONSE_OFFSET,
};
use obd_protocol::{Dtc, ObdProtocol};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration of a virtual adapter and the vehicle behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualElm327Config {
    /// Answer to `ATI` and `ATZ`
    pub identity: String,
    /// Protocol codes the vehicle answers on; empty means no vehicle
    pub vehicle_protocols: Vec<u8>,
    /// Whether `ATSP0` finds the vehicle on its own
    pub auto_search: bool,
    /// Request text (`010C`, `22D40C`) to data bytes in hex (`1AF8`)
    pub responses: BTreeMap<String, String>,
    /// Delay before each answer
    pub response_delay_ms: u64,
    /// Codes reported by mode 03 until cleared
    pub stored_dtcs: Vec<String>,
    /// Codes reported by mode 07 until cleared
    pub pending_dtcs: Vec<String>,
    /// Answer to mode 09 info type 02
    pub vin: String,
}

impl Default for VirtualElm327Config {
    fn default() -> Self {
        let responses = [
            ("0100", "BE3FA813"),
            ("0104", "5A"),
            ("0105", "7B"),
            ("010B", "65"),
            ("010C", "1AF8"),
            ("010D", "28"),
            ("010F", "46"),
            ("0110", "0190"),
            ("0111", "33"),
            ("0120", "80020001"),
            ("012F", "80"),
            ("0140", "44000000"),
            ("0142", "3A98"),
            ("0146", "3C"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            identity: "ELM327 v1.5".to_string(),
            vehicle_protocols: vec![ObdProtocol::Can11Bit500k.code()],
            auto_search: true,
            responses,
            response_delay_ms: 0,
            stored_dtcs: vec!["P0133".to_string(), "U0100".to_string()],
            pending_dtcs: vec!["P0171".to_string()],
            vin: "1D4GP00R55B123456".to_string(),
        }
    }
}

impl VirtualElm327Config {
    /// A vehicle that only talks on one protocol
    pub fn on_protocol(protocol: ObdProtocol) -> Self {
        Self {
            vehicle_protocols: vec![protocol.code()],
            ..Self::default()
        }
    }

    /// An adapter with nothing plugged in
    pub fn without_vehicle() -> Self {
        Self {
            vehicle_protocols: Vec::new(),
            ..Self::default()
        }
    }
}

/// A simulated adapter
#[derive(Debug, Clone)]
pub struct VirtualElm327 {
    config: VirtualElm327Config,
    echo: bool,
    linefeeds: bool,
    spaces: bool,
    headers: bool,
    protocol: u8,
    /// Bus found by an automatic search
    detected: Option<u8>,
    silent: bool,
    history: Vec<String>,
}

impl VirtualElm327 {
    pub fn new(config: VirtualElm327Config) -> Self {
        Self {
            config,
            echo: true,
            linefeeds: true,
            spaces: true,
            headers: false,
            protocol: 0,
            detected: None,
            silent: false,
            history: Vec::new(),
        }
    }

    /// Every command received, in order
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    /// Stop answering (commands are still recorded)
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Codes mode 03 currently reports
    pub fn stored_dtcs(&self) -> &[String] {
        &self.config.stored_dtcs
    }

    pub fn set_stored_dtcs(&mut self, codes: &[&str]) {
        self.config.stored_dtcs = codes.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_response(&mut self, request: &str, data_hex: &str) {
        self.config
            .responses
            .insert(request.to_ascii_uppercase(), data_hex.to_ascii_uppercase());
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.config.response_delay_ms)
    }

    fn reset(&mut self) {
        self.echo = true;
        self.linefeeds = true;
        self.spaces = true;
        self.headers = false;
        self.protocol = 0;
        self.detected = None;
    }

    /// Process one command line and return the full framed answer
    ///
    /// Returns `None` while silent.
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        let command: String = line
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        self.history.push(command.clone());
        debug!("Virtual ELM327 received {:?}", command);

        if self.silent {
            return None;
        }

        // Echo reflects the state before the command runs
        let echo = self.echo;
        let body = if let Some(at) = command.strip_prefix("AT") {
            self.process_at(at)
        } else if is_obd_request(&command) {
            self.process_request(&command)
        } else {
            "?".to_string()
        };

        let eol = if self.linefeeds { "\r\n" } else { "\r" };
        let mut out = String::new();
        if echo {
            out.push_str(line.trim());
            out.push_str(eol);
        }
        out.push_str(&body.replace('\r', eol));
        out.push_str(eol);
        out.push_str(eol);
        out.push('>');
        Some(out)
    }

    fn process_at(&mut self, at: &str) -> String {
        let ok = || "OK".to_string();
        match at {
            "Z" | "WS" => {
                self.reset();
                format!("\r{}", self.config.identity)
            }
            "I" => self.config.identity.clone(),
            "E0" => {
                self.echo = false;
                ok()
            }
            "E1" => {
                self.echo = true;
                ok()
            }
            "L0" => {
                self.linefeeds = false;
                ok()
            }
            "L1" => {
                self.linefeeds = true;
                ok()
            }
            "S0" => {
                self.spaces = false;
                ok()
            }
            "S1" => {
                self.spaces = true;
                ok()
            }
            "H0" => {
                self.headers = false;
                ok()
            }
            "H1" => {
                self.headers = true;
                ok()
            }
            "AT0" | "AT1" | "AT2" | "D" => ok(),
            "DPN" => match (self.protocol, self.detected) {
                (0, Some(bus)) => format!("A{:X}", bus),
                (0, None) => "A0".to_string(),
                (code, _) => format!("{:X}", code),
            },
            "DP" => {
                let code = if self.protocol == 0 {
                    self.detected.unwrap_or(0)
                } else {
                    self.protocol
                };
                let name = ObdProtocol::from_code(code)
                    .map(|p| p.name())
                    .unwrap_or("Unknown");
                if self.protocol == 0 {
                    format!("AUTO, {}", name)
                } else {
                    name.to_string()
                }
            }
            other => {
                if let Some(timeout) = other.strip_prefix("ST") {
                    return match u8::from_str_radix(timeout, 16) {
                        Ok(_) => ok(),
                        Err(_) => "?".to_string(),
                    };
                }
                let selected = other
                    .strip_prefix("SPA")
                    .or_else(|| other.strip_prefix("SP"))
                    .and_then(|code| u8::from_str_radix(code, 16).ok())
                    .filter(|code| ObdProtocol::from_code(*code).is_some());
                match selected {
                    Some(code) => {
                        self.protocol = code;
                        self.detected = None;
                        ok()
                    }
                    None => "?".to_string(),
                }
            }
        }
    }

    fn process_request(&mut self, command: &str) -> String {
        let mut prefix = String::new();
        let bus = if self.protocol == 0 {
            match self.detected {
                Some(bus) => bus,
                None => {
                    prefix.push_str("SEARCHING...\r");
                    match self.config.vehicle_protocols.first().filter(|_| self.config.auto_search) {
                        Some(bus) => {
                            self.detected = Some(*bus);
                            *bus
                        }
                        None => return format!("{}UNABLE TO CONNECT", prefix),
                    }
                }
            }
        } else {
            self.protocol
        };

        if !self.config.vehicle_protocols.contains(&bus) {
            return match ObdProtocol::from_code(bus) {
                Some(p) if p.is_can() => "CAN ERROR".to_string(),
                Some(ObdProtocol::Iso9141 | ObdProtocol::KwpSlowInit | ObdProtocol::KwpFastInit) => {
                    "BUS INIT: ...ERROR".to_string()
                }
                _ => "NO DATA".to_string(),
            };
        }

        let Some(request) = hex_to_bytes(command) else {
            return "?".to_string();
        };
        let mut payload = vec![request[0].wrapping_add(POSITIVE_RESPONSE_OFFSET)];
        match request.as_slice() {
            [MODE_STORED_DTCS] => payload.extend(self.dtc_payload(&self.config.stored_dtcs, bus)),
            [MODE_PENDING_DTCS] => payload.extend(self.dtc_payload(&self.config.pending_dtcs, bus)),
            [MODE_CLEAR_DTCS] => {
                self.config.stored_dtcs.clear();
                self.config.pending_dtcs.clear();
            }
            [MODE_VEHICLE_INFO, INFO_TYPE_VIN] => return self.vin_answer(bus, &prefix),
            _ => {
                let Some(data) = self.config.responses.get(command).and_then(|d| hex_to_bytes(d))
                else {
                    return format!("{}NO DATA", prefix);
                };
                payload.extend_from_slice(&request[1..]);
                payload.extend(data);
            }
        }
        format!("{}{}", prefix, self.format_payload(bus, &payload))
    }

    /// Code bytes after the service byte: a count on CAN, else padded triples
    fn dtc_payload(&self, codes: &[String], bus: u8) -> Vec<u8> {
        let bytes: Vec<u8> = codes
            .iter()
            .filter_map(|code| code.parse::<Dtc>().ok())
            .flat_map(Dtc::to_bytes)
            .collect();
        if is_can(bus) {
            let mut payload = vec![(bytes.len() / 2) as u8];
            payload.extend(bytes);
            payload
        } else {
            // Older buses answer with one line of three codes; extra codes are dropped
            let mut padded = bytes;
            padded.resize(6, 0);
            padded
        }
    }

    fn vin_answer(&self, bus: u8, prefix: &str) -> String {
        let service = MODE_VEHICLE_INFO + POSITIVE_RESPONSE_OFFSET;
        if is_can(bus) {
            let mut payload = vec![service, INFO_TYPE_VIN, 0x01];
            payload.extend(self.config.vin.bytes());
            return format!("{}{}", prefix, self.format_payload(bus, &payload));
        }
        // Five lines of four bytes, zero padded at the front
        let mut data = vec![0u8; 20usize.saturating_sub(self.config.vin.len())];
        data.extend(self.config.vin.bytes());
        let lines: Vec<String> = data
            .chunks(4)
            .enumerate()
            .map(|(index, chunk)| {
                let mut line = vec![service, INFO_TYPE_VIN, index as u8 + 1];
                line.extend_from_slice(chunk);
                self.join_bytes(&line)
            })
            .collect();
        format!("{}{}", prefix, lines.join("\r"))
    }

    fn join_bytes(&self, bytes: &[u8]) -> String {
        let separator = if self.spaces { " " } else { "" };
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Render an answer the way the adapter prints it
    ///
    /// CAN answers longer than a single frame are split ISO-TP style: six
    /// bytes in the first frame and seven in each consecutive one. Without
    /// headers the adapter prints a byte count line and `n:` markers.
    fn format_payload(&self, bus: u8, payload: &[u8]) -> String {
        let separator = if self.spaces { " " } else { "" };
        let can = is_can(bus);
        if !can || payload.len() <= 7 {
            if can && self.headers {
                return format!(
                    "7E8{sep}{:02X}{sep}{}",
                    payload.len(),
                    self.join_bytes(payload),
                    sep = separator
                );
            }
            return self.join_bytes(payload);
        }

        let (first, rest) = payload.split_at(6);
        let frames = std::iter::once(first).chain(rest.chunks(7));
        let mut lines = Vec::new();
        if !self.headers {
            lines.push(format!("{:03X}", payload.len()));
        }
        for (index, frame) in frames.enumerate() {
            let line = if self.headers {
                let pci = if index == 0 {
                    format!(
                        "{:02X}{sep}{:02X}",
                        0x10 | ((payload.len() >> 8) & 0x0F) as u8,
                        payload.len() & 0xFF,
                        sep = separator
                    )
                } else {
                    format!("{:02X}", 0x20 | (index & 0x0F) as u8)
                };
                format!("7E8{sep}{}{sep}{}", pci, self.join_bytes(frame), sep = separator)
            } else {
                format!("{:X}:{}{}", index & 0x0F, separator, self.join_bytes(frame))
            };
            lines.push(line);
        }
        lines.join("\r")
    }
}

impl Default for VirtualElm327 {
    fn default() -> Self {
        Self::new(VirtualElm327Config::default())
    }
}

fn is_obd_request(command: &str) -> bool {
    command.len() >= 2 && command.len() % 2 == 0 && command.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_can(bus: u8) -> bool {
    ObdProtocol::from_code(bus).is_some_and(|p| p.is_can())
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
