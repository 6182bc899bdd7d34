//! ResponseParser: adapter text to typed values

use std::fmt;

use tracing::warn;

use crate::dtc::Dtc;
use crate::elm::adapter_error;
use crate::error::{ParseError, Result};
use crate::pid::{
    pid_width_for_mode, PidDefinition, INFO_TYPE_VIN, MODE_CLEAR_DTCS, MODE_CURRENT_DATA,
    MODE_VEHICLE_INFO, NEGATIVE_RESPONSE, POSITIVE_RESPONSE_OFFSET,
};

/// Length in hex digits of an 11-bit CAN header (`7E8`)
const CAN_11BIT_HEADER_DIGITS: usize = 3;

/// Header plus protocol control byte plus one data byte
const MIN_HEADER_LINE_DIGITS: usize = CAN_11BIT_HEADER_DIGITS + 4;

/// Length in characters of a vehicle identification number
const VIN_LEN: usize = 17;

/// Decoded value
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Number(f64),
    /// Undecoded data bytes as uppercase hex
    Raw(String),
}

/// A value plus its unit, produced per response
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParsedValue {
    pub value: Value,
    pub unit: String,
}

impl ParsedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self.value {
            Value::Number(n) => Some(n),
            Value::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.value, Value::Raw(_))
    }
}

impl fmt::Display for ParsedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Number(n) => write!(f, "{} {}", n, self.unit),
            Value::Raw(hex) => write!(f, "{} ({})", hex, self.unit),
        }
    }
}

/// Stateless decoder for PID responses
pub struct ResponseParser;

impl ResponseParser {
    /// Decode `raw` as the answer to `pid`
    pub fn parse(pid: &PidDefinition, raw: &str) -> Result<ParsedValue> {
        if let Some(error) = adapter_error(raw) {
            return Err(ParseError::AdapterError(error.to_string()));
        }

        let bytes = Self::hex_bytes(raw)?;
        let prefix = pid.response_prefix();
        let data = match find_subslice(&bytes, &prefix) {
            Some(pos) => &bytes[pos + prefix.len()..],
            None => {
                warn!(
                    "Response to {} does not echo {}; decoding all bytes",
                    pid.command(),
                    to_hex(&prefix)
                );
                &bytes[..]
            }
        };

        match &pid.formula {
            Some(formula) => {
                let value = formula.evaluate(data)?;
                Ok(ParsedValue {
                    value: Value::Number(round2(value)),
                    unit: pid.unit.clone(),
                })
            }
            None => Ok(ParsedValue {
                value: Value::Raw(to_hex(data)),
                unit: "raw".into(),
            }),
        }
    }

    /// Whether `response` can be the answer to `request`
    ///
    /// Positive (`41 0C ..`) and negative (`7F 01 ..`) answers are checked
    /// against the request's mode and PID. AT commands, adapter error lines
    /// and text without hex data are accepted as they are.
    pub fn answers_request(request: &str, response: &str) -> bool {
        let Some(request) = request_bytes(request) else {
            return true;
        };
        if adapter_error(response).is_some() {
            return true;
        }
        let Ok(bytes) = Self::hex_bytes(response) else {
            return true;
        };

        let mode = request[0];
        match bytes[0] {
            NEGATIVE_RESPONSE => bytes.get(1).map_or(true, |rejected| *rejected == mode),
            service if is_positive_service(service) => {
                if service != mode.wrapping_add(POSITIVE_RESPONSE_OFFSET) {
                    return false;
                }
                let width = pid_width_for_mode(mode).min(request.len() - 1);
                bytes.get(1..1 + width) == Some(&request[1..1 + width])
            }
            _ => true,
        }
    }

    /// Decode a supported-PIDs bitmap (`0100`, `0120`, ...)
    ///
    /// Every ECU that answers contributes its bits. Bit 7 of the first data
    /// byte stands for `base + 1`; the result is sorted and deduplicated.
    pub fn parse_supported_pids(base: u8, raw: &str) -> Result<Vec<u16>> {
        if let Some(error) = adapter_error(raw) {
            return Err(ParseError::AdapterError(error.to_string()));
        }
        let bytes = Self::hex_bytes(raw)?;
        let service = MODE_CURRENT_DATA + POSITIVE_RESPONSE_OFFSET;
        let unexpected = || ParseError::UnexpectedResponse {
            expected: format!("{:02X}{:02X}", MODE_CURRENT_DATA, base),
            found: to_hex(&bytes),
        };

        let mut pids = Vec::new();
        for record in bytes.chunks(6) {
            let [s, b, bitmap @ ..] = record else {
                return Err(unexpected());
            };
            if *s != service || *b != base || bitmap.len() != 4 {
                return Err(unexpected());
            }
            let bits = u32::from_be_bytes([bitmap[0], bitmap[1], bitmap[2], bitmap[3]]);
            pids.extend(
                (0..32u16)
                    .filter(|i| bits & (0x8000_0000 >> i) != 0)
                    .map(|i| u16::from(base) + i + 1),
            );
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Decode a trouble code answer for `mode` (`03`, `07` or `0A`)
    ///
    /// CAN vehicles prefix the codes with a count (`43 02 01 33 C1 00`);
    /// older buses send three codes per line padded with `0000`. A vehicle
    /// without codes may answer `NO DATA`, which yields an empty list.
    pub fn parse_dtcs(mode: u8, raw: &str) -> Result<Vec<Dtc>> {
        if let Some(error) = adapter_error(raw) {
            if error.eq_ignore_ascii_case("NO DATA") {
                return Ok(Vec::new());
            }
            return Err(ParseError::AdapterError(error.to_string()));
        }
        let bytes = Self::hex_bytes(raw)?;
        let service = mode.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        let unexpected = || ParseError::UnexpectedResponse {
            expected: format!("{:02X}", mode),
            found: to_hex(&bytes),
        };

        let mut codes = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes[pos..].iter().all(|b| *b == 0) {
                break;
            }
            if bytes[pos] != service {
                return Err(unexpected());
            }
            let counted_end = bytes
                .get(pos + 1)
                .map(|count| pos + 2 + 2 * usize::from(*count))
                .filter(|end| {
                    *end <= bytes.len()
                        && (bytes.get(*end).map_or(true, |next| *next == service)
                            || bytes[*end..].iter().all(|b| *b == 0))
                });
            let (body, next) = match counted_end {
                Some(end) => (&bytes[pos + 2..end], end),
                None => {
                    let end = (pos + 7).min(bytes.len());
                    (&bytes[pos + 1..end], end)
                }
            };
            if body.len() % 2 != 0 {
                return Err(unexpected());
            }
            codes.extend(
                body.chunks(2)
                    .map(|pair| Dtc::from_bytes(pair[0], pair[1]))
                    .filter(|dtc| !dtc.is_padding()),
            );
            pos = next;
        }
        Ok(codes)
    }

    /// Check the answer to a clear-codes request (`04` -> `44`)
    pub fn confirm_cleared(raw: &str) -> Result<()> {
        if let Some(error) = adapter_error(raw) {
            return Err(ParseError::AdapterError(error.to_string()));
        }
        let bytes = Self::hex_bytes(raw)?;
        if bytes[0] != MODE_CLEAR_DTCS + POSITIVE_RESPONSE_OFFSET {
            return Err(ParseError::UnexpectedResponse {
                expected: format!("{:02X}", MODE_CLEAR_DTCS),
                found: to_hex(&bytes),
            });
        }
        Ok(())
    }

    /// Decode the vehicle identification number (mode `09`, info type `02`)
    ///
    /// CAN vehicles send one multi-frame message (`49 02 01` then 17
    /// characters); older buses send five `49 02 nn` lines of four bytes
    /// with leading zero padding.
    pub fn parse_vin(raw: &str) -> Result<String> {
        if let Some(error) = adapter_error(raw) {
            return Err(ParseError::AdapterError(error.to_string()));
        }
        let bytes = Self::hex_bytes(raw)?;
        let prefix = [MODE_VEHICLE_INFO + POSITIVE_RESPONSE_OFFSET, INFO_TYPE_VIN];
        if !bytes.starts_with(&prefix) {
            return Err(ParseError::UnexpectedResponse {
                expected: format!("{:02X}{:02X}", MODE_VEHICLE_INFO, INFO_TYPE_VIN),
                found: to_hex(&bytes),
            });
        }

        // `I` (0x49) never appears in a VIN, so a repeated prefix marks a line
        let mut data = Vec::new();
        let mut rest = &bytes[..];
        while rest.starts_with(&prefix) {
            let line_end = if rest.len() > 7 && rest[7..].starts_with(&prefix) {
                7
            } else {
                rest.len()
            };
            data.extend_from_slice(rest.get(3..line_end).unwrap_or_default());
            rest = &rest[line_end..];
        }

        let vin: String = data
            .iter()
            .filter(|b| b.is_ascii_alphanumeric())
            .map(|b| char::from(*b))
            .collect();
        if vin.len() != VIN_LEN {
            return Err(ParseError::InvalidVin(vin));
        }
        Ok(vin)
    }

    /// Extract the data bytes of a response
    ///
    /// Non-hex characters are dropped line by line. A line left with an odd
    /// number of digits either is the byte count of a multi-frame answer
    /// (`014`) or starts with an 11-bit CAN header, in which case the header
    /// and the protocol control byte are removed. Any other odd line is
    /// malformed.
    pub fn hex_bytes(raw: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for line in raw.split(['\r', '\n']) {
            let line = line.trim();
            let upper = line.to_ascii_uppercase();
            if line.is_empty() || upper.starts_with("SEARCHING") || upper.starts_with("BUS INIT") {
                continue;
            }
            // Multi-frame index marker ("0:", "1:")
            let (body, indexed) = match line.split_once(':') {
                Some((index, rest)) if index.trim().chars().all(|c| c.is_ascii_hexdigit()) => {
                    (rest, true)
                }
                _ => (line, false),
            };
            let digits: Vec<u8> = body.bytes().filter(u8::is_ascii_hexdigit).collect();
            let invalid = || ParseError::InvalidHex(line.to_string());

            if digits.len() % 2 == 0 {
                bytes.extend(decode_pairs(&digits).ok_or_else(invalid)?);
                continue;
            }
            if indexed || digits.len() < MIN_HEADER_LINE_DIGITS {
                if !indexed && digits.len() == CAN_11BIT_HEADER_DIGITS {
                    // Byte count line of a multi-frame answer ("014")
                    continue;
                }
                return Err(invalid());
            }
            let frame = decode_pairs(&digits[CAN_11BIT_HEADER_DIGITS..]).ok_or_else(invalid)?;
            bytes.extend_from_slice(can_frame_data(&frame).ok_or_else(invalid)?);
        }
        if bytes.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(bytes)
    }
}

/// Request text as bytes, when it is a hex OBD request
fn request_bytes(request: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = request.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() < 2 || digits.len() % 2 != 0 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    decode_pairs(&digits)
}

/// Services a positive answer can start with (`41` for mode 01 up to `7E`)
fn is_positive_service(byte: u8) -> bool {
    (POSITIVE_RESPONSE_OFFSET + 1..NEGATIVE_RESPONSE).contains(&byte)
}

fn decode_pairs(digits: &[u8]) -> Option<Vec<u8>> {
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

/// Data bytes of one CAN frame after its protocol control byte
///
/// Single frames (`0N`) carry N bytes, first frames (`1N LL`) start a
/// multi-frame message and consecutive frames (`2N`) continue it.
fn can_frame_data(frame: &[u8]) -> Option<&[u8]> {
    let (pci, rest) = frame.split_first()?;
    match pci >> 4 {
        0 => {
            let len = usize::from(pci & 0x0F);
            (len > 0 && len <= rest.len()).then(|| &rest[..len])
        }
        1 => rest.get(1..).filter(|data| !data.is_empty()),
        2 => Some(rest),
        _ => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
