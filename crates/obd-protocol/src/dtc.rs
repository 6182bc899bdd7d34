//! Diagnostic trouble codes
//!
//! Modes `03` (stored) and `07` (pending) answer with two bytes per code.
//! The top two bits of the first byte select the system letter, the next
//! two bits the first digit, and the remaining twelve bits are the last
//! three hex digits: `01 33` is `P0133`, `C1 00` is `U0100`.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// System a trouble code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DtcCategory {
    /// P codes: engine and transmission
    Powertrain,
    /// C codes: ABS, suspension, steering
    Chassis,
    /// B codes: airbags, climate, comfort
    Body,
    /// U codes: bus communication
    Network,
}

impl DtcCategory {
    /// Category encoded in the first response byte
    pub fn from_high_byte(high: u8) -> Self {
        match high >> 6 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn bits(&self) -> u16 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }
}

impl fmt::Display for DtcCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DtcCategory::Powertrain => "powertrain",
            DtcCategory::Chassis => "chassis",
            DtcCategory::Body => "body",
            DtcCategory::Network => "network",
        };
        f.write_str(name)
    }
}

/// One trouble code as reported by the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dtc(u16);

impl Dtc {
    pub fn from_bytes(high: u8, low: u8) -> Self {
        Dtc(u16::from_be_bytes([high, low]))
    }

    /// The two bytes the vehicle sends for this code
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_high_byte((self.0 >> 8) as u8)
    }

    /// `0000` pads short answers and is not a code
    pub fn is_padding(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:X}{:03X}",
            self.category().letter(),
            (self.0 >> 12) & 0x3,
            self.0 & 0x0FFF
        )
    }
}

impl FromStr for Dtc {
    type Err = ParseError;

    /// Parse `P0133`-style text
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidDtc(s.to_string());
        let text = s.trim();
        let mut chars = text.chars();
        let category = chars
            .next()
            .and_then(DtcCategory::from_letter)
            .ok_or_else(invalid)?;
        let digits = chars.as_str();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let number = u16::from_str_radix(digits, 16).map_err(|_| invalid())?;
        if number > 0x3FFF {
            return Err(invalid());
        }
        Ok(Dtc((category.bits() << 14) | number))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Dtc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Dtc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
