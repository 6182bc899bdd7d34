//! OBD2 transport protocols selectable on an ELM327

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Vehicle bus protocol, numbered the way `ATSP`/`ATDPN` number them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObdProtocol {
    /// Let the adapter search on its own
    Automatic,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (5 baud init)
    Iso9141,
    /// ISO 14230-4 KWP (5 baud init)
    KwpSlowInit,
    /// ISO 14230-4 KWP (fast init)
    KwpFastInit,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Can11Bit500k,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Can29Bit500k,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Can11Bit250k,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Can29Bit250k,
}

impl ObdProtocol {
    /// Every protocol in code order
    pub const ALL: [ObdProtocol; 10] = [
        ObdProtocol::Automatic,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141,
        ObdProtocol::KwpSlowInit,
        ObdProtocol::KwpFastInit,
        ObdProtocol::Can11Bit500k,
        ObdProtocol::Can29Bit500k,
        ObdProtocol::Can11Bit250k,
        ObdProtocol::Can29Bit250k,
    ];

    /// Explicit candidates in the order most vehicles are likely to answer:
    /// CAN first, then KWP, then the legacy buses.
    pub const PRIORITY: [ObdProtocol; 9] = [
        ObdProtocol::Can11Bit500k,
        ObdProtocol::Can29Bit500k,
        ObdProtocol::Can11Bit250k,
        ObdProtocol::Can29Bit250k,
        ObdProtocol::KwpFastInit,
        ObdProtocol::KwpSlowInit,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141,
    ];

    /// Numeric code used by `ATSP` and reported by `ATDPN`
    pub fn code(&self) -> u8 {
        match self {
            ObdProtocol::Automatic => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141 => 3,
            ObdProtocol::KwpSlowInit => 4,
            ObdProtocol::KwpFastInit => 5,
            ObdProtocol::Can11Bit500k => 6,
            ObdProtocol::Can29Bit500k => 7,
            ObdProtocol::Can11Bit250k => 8,
            ObdProtocol::Can29Bit250k => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Human-readable protocol name
    pub fn name(&self) -> &'static str {
        match self {
            ObdProtocol::Automatic => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141 => "ISO 9141-2",
            ObdProtocol::KwpSlowInit => "ISO 14230-4 KWP (5 baud init)",
            ObdProtocol::KwpFastInit => "ISO 14230-4 KWP (fast init)",
            ObdProtocol::Can11Bit500k => "ISO 15765-4 CAN (11 bit ID, 500 kbaud)",
            ObdProtocol::Can29Bit500k => "ISO 15765-4 CAN (29 bit ID, 500 kbaud)",
            ObdProtocol::Can11Bit250k => "ISO 15765-4 CAN (11 bit ID, 250 kbaud)",
            ObdProtocol::Can29Bit250k => "ISO 15765-4 CAN (29 bit ID, 250 kbaud)",
        }
    }

    /// The `ATSPn` command that selects this protocol
    pub fn select_command(&self) -> String {
        format!("ATSP{}", self.code())
    }

    pub fn is_can(&self) -> bool {
        self.code() >= 6
    }

    /// Parse an `ATDPN` answer such as `A6` (auto, currently 6) or `3`
    pub fn from_dpn_response(response: &str) -> Result<Self, ParseError> {
        let trimmed = response.trim();
        let digits = trimmed
            .strip_prefix('A')
            .or_else(|| trimmed.strip_prefix('a'))
            .unwrap_or(trimmed);
        let code = u8::from_str_radix(digits, 16)
            .map_err(|_| ParseError::UnknownProtocol(trimmed.to_string()))?;
        Self::from_code(code).ok_or_else(|| ParseError::UnknownProtocol(trimmed.to_string()))
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ObdProtocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: u8 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::UnknownProtocol(s.to_string()))?;
        Self::from_code(code).ok_or_else(|| ParseError::UnknownProtocol(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for proto in ObdProtocol::ALL {
            assert_eq!(ObdProtocol::from_code(proto.code()), Some(proto));
        }
        assert_eq!(ObdProtocol::from_code(10), None);
    }

    #[test]
    fn test_select_command() {
        assert_eq!(ObdProtocol::Can11Bit500k.select_command(), "ATSP6");
        assert_eq!(ObdProtocol::Automatic.select_command(), "ATSP0");
    }

    #[test]
    fn test_dpn_parsing() {
        assert_eq!(
            ObdProtocol::from_dpn_response("A6").unwrap(),
            ObdProtocol::Can11Bit500k
        );
        assert_eq!(
            ObdProtocol::from_dpn_response(" 3 ").unwrap(),
            ObdProtocol::Iso9141
        );
        assert!(ObdProtocol::from_dpn_response("AX").is_err());
        assert!(ObdProtocol::from_dpn_response("C").is_err());
    }

    #[test]
    fn test_priority_excludes_automatic() {
        assert!(!ObdProtocol::PRIORITY.contains(&ObdProtocol::Automatic));
        assert!(ObdProtocol::PRIORITY[..4].iter().all(|p| p.is_can()));
    }
}
