//! Compatibility scoring for OBD2 adapters
//!
//! Adapters are recognised by name substrings, by a small list of address
//! prefixes used by common clones, by pairing status and by signal strength.
//! Scores are clamped to 0..=100.

use serde::{Deserialize, Serialize};

use crate::transport::RawDevice;

/// Best guess at what kind of adapter a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    Elm327,
    Obd2Generic,
    Unknown,
}

/// Name keywords and their weight (case-insensitive substring match)
pub mod keywords {
    pub const NAME_WEIGHTS: &[(&str, u8)] = &[
        ("elm327", 100),
        ("elm 327", 100),
        ("vgate", 95),
        ("viecar", 90),
        ("konnwei", 85),
        ("icar", 80),
        ("obd", 75),
        ("autel", 70),
        ("launch", 70),
        ("foxwell", 70),
        ("topdon", 70),
        ("diagnostic", 60),
        ("torque", 50),
        ("scan", 40),
        ("bluetooth", 30),
    ];

    /// Keywords that identify an ELM327 command set specifically
    pub const ELM_FAMILY: &[&str] = &["elm327", "elm 327", "vgate", "viecar", "konnwei", "icar"];

    /// Firmware version tags adapters often put in their name
    pub const VERSION_TAGS: &[&str] = &["v1.5", "v2.1", "v1.4", "v2.2"];

    /// Audio and input peripherals that are never adapters
    pub const EXCLUDED: &[&str] = &[
        "headphone",
        "headset",
        "earbud",
        "airpods",
        "buds",
        "speaker",
        "soundbar",
        "keyboard",
        "mouse",
        "watch",
        "jbl",
        "bose",
        "beats",
        "sony wh",
        "tv",
    ];

    /// Address prefixes of common adapter modules
    pub const KNOWN_ADDRESS_PREFIXES: &[&str] = &["00:1D:A5", "00:0D:18", "AA:BB:CC", "66:1E:32"];
}

const VERSION_BONUS: u32 = 10;
const ADDRESS_BONUS: u32 = 40;
const PAIRED_BONUS: u32 = 50;
const STRONG_SIGNAL_DBM: i16 = -60;
const MEDIUM_SIGNAL_DBM: i16 = -75;

fn lowercase_name(device: &RawDevice) -> Option<String> {
    device.name().map(str::to_lowercase)
}

fn name_weight(name: &str) -> Option<u8> {
    keywords::NAME_WEIGHTS
        .iter()
        .filter(|(kw, _)| name.contains(kw))
        .map(|(_, weight)| *weight)
        .max()
}

/// True when a word-ish keyword appears in the name
///
/// Short keywords like `tv` only count as whole words.
fn contains_keyword(name: &str, keyword: &str) -> bool {
    if keyword.len() > 3 {
        return name.contains(keyword);
    }
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == keyword)
}

/// Devices on the exclusion list are dropped regardless of score
pub fn is_excluded(device: &RawDevice) -> bool {
    lowercase_name(device)
        .map(|name| keywords::EXCLUDED.iter().any(|kw| contains_keyword(&name, kw)))
        .unwrap_or(false)
}

pub fn has_known_address(device: &RawDevice) -> bool {
    let id = device.id.to_ascii_uppercase();
    keywords::KNOWN_ADDRESS_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

/// Compatibility score 0..=100
pub fn compatibility_score(device: &RawDevice) -> u8 {
    let mut score: u32 = 0;

    if let Some(name) = lowercase_name(device) {
        score += u32::from(name_weight(&name).unwrap_or(0));
        if keywords::VERSION_TAGS.iter().any(|tag| name.contains(tag)) {
            score += VERSION_BONUS;
        }
    }

    if has_known_address(device) {
        score += ADDRESS_BONUS;
    }

    if device.already_paired {
        score += PAIRED_BONUS;
    }

    match device.signal_strength {
        Some(rssi) if rssi > STRONG_SIGNAL_DBM => score += 10,
        Some(rssi) if rssi > MEDIUM_SIGNAL_DBM => score += 5,
        _ => {}
    }

    score.min(100) as u8
}

pub fn guess_kind(device: &RawDevice) -> AdapterKind {
    match lowercase_name(device) {
        Some(name) if keywords::ELM_FAMILY.iter().any(|kw| name.contains(kw)) => {
            AdapterKind::Elm327
        }
        Some(name) if name_weight(&name).is_some() => AdapterKind::Obd2Generic,
        _ if has_known_address(device) => AdapterKind::Elm327,
        _ => AdapterKind::Unknown,
    }
}

/// Whether a device is worth offering as an OBD2 adapter
///
/// Unnamed devices pass when `include_unnamed` is set, since many adapters
/// advertise no name. Paired devices always pass unless excluded.
pub fn is_likely_obd2(device: &RawDevice, include_unnamed: bool) -> bool {
    if is_excluded(device) {
        return false;
    }
    match lowercase_name(device) {
        None => include_unnamed || device.already_paired || has_known_address(device),
        Some(name) => {
            name_weight(&name).is_some() || has_known_address(device) || device.already_paired
        }
    }
}

/// Name shown for a device, with a placeholder for unnamed ones
pub fn display_name(device: &RawDevice) -> String {
    match device.name() {
        Some(name) => name.to_string(),
        None => {
            let tail: String = device
                .id
                .chars()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("Unknown Device ({})", tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> RawDevice {
        RawDevice::discovered("11:22:33:44:55:66", Some(name), None)
    }

    #[test]
    fn test_elm327_scores_full() {
        assert_eq!(compatibility_score(&named("OBDII ELM327 v1.5")), 100);
        assert_eq!(guess_kind(&named("OBDII ELM327 v1.5")), AdapterKind::Elm327);
    }

    #[test]
    fn test_keyword_weights() {
        assert_eq!(compatibility_score(&named("Vgate iCar Pro")), 95);
        assert_eq!(compatibility_score(&named("KONNWEI KW902")), 85);
        assert_eq!(compatibility_score(&named("Car Scanner")), 40);
        assert_eq!(compatibility_score(&named("Generic Bluetooth")), 30);
        assert_eq!(compatibility_score(&named("Phone")), 0);
    }

    #[test]
    fn test_bonuses() {
        let mut device = named("OBD Scan");
        assert_eq!(compatibility_score(&device), 75);
        device.signal_strength = Some(-50);
        assert_eq!(compatibility_score(&device), 85);
        device.signal_strength = Some(-70);
        assert_eq!(compatibility_score(&device), 80);
        device.already_paired = true;
        assert_eq!(compatibility_score(&device), 100);

        let known = RawDevice::discovered("00:1d:a5:01:02:03", None, None);
        assert_eq!(compatibility_score(&known), 40);
        assert_eq!(guess_kind(&known), AdapterKind::Elm327);
    }

    #[test]
    fn test_exclusions() {
        assert!(is_excluded(&named("JBL Flip 5")));
        assert!(is_excluded(&named("Galaxy Buds")));
        assert!(is_excluded(&named("Living Room TV")));
        assert!(!is_excluded(&named("OBD2 Motive")));
        assert!(!is_likely_obd2(&named("Bluetooth Speaker"), true));
    }

    #[test]
    fn test_unnamed_devices_are_included() {
        let unnamed = RawDevice::discovered("AB:CD:EF:01:23:45", None, Some(-80));
        assert!(is_likely_obd2(&unnamed, true));
        assert!(!is_likely_obd2(&unnamed, false));
        assert_eq!(display_name(&unnamed), "Unknown Device (23:45)");

        let blank = RawDevice::discovered("AB:CD:EF:01:23:45", Some("   "), None);
        assert!(blank.name().is_none());
        assert_eq!(guess_kind(&blank), AdapterKind::Unknown);
    }

    #[test]
    fn test_unrelated_named_device_filtered() {
        assert!(!is_likely_obd2(&named("Pixel 8"), true));
        let mut paired = named("Pixel 8");
        paired.already_paired = true;
        assert!(is_likely_obd2(&paired, true));
    }
}
