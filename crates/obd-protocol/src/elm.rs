//! ELM327 command set and response framing
//!
//! The adapter speaks plain text: every command is terminated by a carriage
//! return, and every answer ends with the `>` prompt once the adapter is ready
//! for the next command. Between the command and the prompt the adapter may
//! send the echoed command (when echo is on), informational lines such as
//! `SEARCHING...`, blank lines, and finally hex data or an error line.

/// Terminator appended to every command written to the adapter
pub const LINE_TERMINATOR: &str = "\r";

/// Prompt byte marking the end of a response
pub const PROMPT: u8 = b'>';

/// AT configuration commands
pub mod at {
    /// Full reset
    pub const RESET: &str = "ATZ";
    pub const ECHO_OFF: &str = "ATE0";
    pub const LINEFEEDS_OFF: &str = "ATL0";
    pub const SPACES_OFF: &str = "ATS0";
    pub const HEADERS_ON: &str = "ATH1";
    pub const HEADERS_OFF: &str = "ATH0";
    pub const ADAPTIVE_TIMING_ON: &str = "ATAT1";
    /// Report the current protocol number (`A6` while in automatic mode)
    pub const DESCRIBE_PROTOCOL_NUMBER: &str = "ATDPN";
    /// Adapter identity, e.g. `ELM327 v1.5`
    pub const IDENTIFY: &str = "ATI";

    /// `ATST` takes the timeout in units of 4ms, as two hex digits
    pub fn set_timeout(timeout_ms: u32) -> String {
        let units = (timeout_ms / 4).clamp(1, 0xFF);
        format!("ATST{:02X}", units)
    }
}

/// Lines the adapter sends instead of data when a request fails
pub const ADAPTER_ERRORS: &[&str] = &[
    "?",
    "NO DATA",
    "ERROR",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS BUSY",
    "BUS ERROR",
    "DATA ERROR",
    "FB ERROR",
    "BUFFER FULL",
    "RX ERROR",
    "STOPPED",
    "LV RESET",
    "ACT ALERT",
];

/// Splits an incoming byte stream into prompt-terminated responses
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(128),
        }
    }

    /// Push raw bytes received from the adapter
    pub fn push_bytes(&mut self, data: &[u8]) {
        // NUL bytes show up on some clones right after a reset
        self.buffer.extend(data.iter().copied().filter(|b| *b != 0));
    }

    /// Take the next complete response (everything before a prompt)
    pub fn next_response(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == PROMPT)?;
        let frame: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&frame[..end]).into_owned())
    }

    /// Number of bytes waiting for a prompt
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered so far
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn is_informational(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    upper.starts_with("SEARCHING")
        || (upper.starts_with("BUS INIT") && !upper.contains("ERROR"))
}

/// Turn a raw frame into the lines a caller cares about
///
/// Strips prompt and line framing, drops the echoed command (when echo is
/// still on) and informational lines, and trims each remaining line.
pub fn clean_lines(raw: &str, sent: &str) -> Vec<String> {
    let echo = squash(sent);
    raw.split(['\r', '\n'])
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == '>'))
        .filter(|line| !line.is_empty())
        .filter(|line| echo.is_empty() || squash(line) != echo)
        .filter(|line| !is_informational(line))
        .map(str::to_string)
        .collect()
}

/// [`clean_lines`] joined with newlines
pub fn clean_response(raw: &str, sent: &str) -> String {
    clean_lines(raw, sent).join("\n")
}

/// Returns the adapter error line contained in a response, if any
pub fn adapter_error(response: &str) -> Option<&str> {
    response
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let upper = line.to_ascii_uppercase();
            ADAPTER_ERRORS.iter().any(|kw| {
                if *kw == "?" {
                    upper == "?"
                } else {
                    upper.starts_with(kw) || (upper.starts_with("BUS INIT") && upper.contains(kw))
                }
            })
        })
}

/// True when a response carries hex data and no adapter error
///
/// Multi-frame answers prefix continuation lines with `0:`, `1:` and so on;
/// those index markers are accepted.
pub fn is_hex_payload(response: &str) -> bool {
    if response.trim().is_empty() || adapter_error(response).is_some() {
        return false;
    }
    response
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| {
            let body = match line.split_once(':') {
                Some((index, rest)) if index.trim().chars().all(|c| c.is_ascii_hexdigit()) => rest,
                _ => line,
            };
            let digits: Vec<char> = body.chars().filter(|c| !c.is_whitespace()).collect();
            !digits.is_empty() && digits.iter().all(|c| c.is_ascii_hexdigit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_framer_single_response() {
        let mut framer = ResponseFramer::new();
        framer.push_bytes(b"41 0C 1A F8\r\r");
        assert!(framer.next_response().is_none());
        framer.push_bytes(b">");
        assert_eq!(framer.next_response().as_deref(), Some("41 0C 1A F8\r\r"));
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_framer_back_to_back() {
        let mut framer = ResponseFramer::new();
        framer.push_bytes(b"OK\r\r>ELM327 v1.5\r\r>");
        assert_eq!(framer.next_response().as_deref(), Some("OK\r\r"));
        assert_eq!(framer.next_response().as_deref(), Some("ELM327 v1.5\r\r"));
        assert!(framer.next_response().is_none());
    }

    #[test]
    fn test_framer_clear_discards_stale_bytes() {
        let mut framer = ResponseFramer::new();
        framer.push_bytes(b"41 0D 3");
        framer.clear();
        framer.push_bytes(b"OK\r>");
        assert_eq!(framer.next_response().as_deref(), Some("OK\r"));
    }

    #[test]
    fn test_clean_strips_echo_and_searching() {
        let raw = "010C\rSEARCHING...\r41 0C 1A F8\r\r";
        assert_eq!(clean_response(raw, "010C"), "41 0C 1A F8");
    }

    #[test]
    fn test_clean_without_echo() {
        assert_eq!(clean_response("\r\n410D28\r\n\r\n", "010D"), "410D28");
    }

    #[test]
    fn test_adapter_error_detection() {
        assert_eq!(adapter_error("NO DATA"), Some("NO DATA"));
        assert_eq!(adapter_error("?"), Some("?"));
        assert_eq!(adapter_error("UNABLE TO CONNECT"), Some("UNABLE TO CONNECT"));
        assert_eq!(adapter_error("BUS INIT: ...ERROR"), Some("BUS INIT: ...ERROR"));
        assert_eq!(adapter_error("41 0C 1A F8"), None);
        assert_eq!(adapter_error("ELM327 v1.5"), None);
    }

    #[test]
    fn test_hex_payload() {
        assert!(is_hex_payload("41 00 BE 3F A8 13"));
        assert!(is_hex_payload("7E8 04 41 0C 1A F8"));
        assert!(is_hex_payload("014\n0: 49 02 01 31 44 34\n1: 47 50 30 30 52 35 35"));
        assert!(!is_hex_payload("NO DATA"));
        assert!(!is_hex_payload("OK"));
        assert!(!is_hex_payload(""));
    }

    #[test]
    fn test_set_timeout() {
        assert_eq!(at::set_timeout(400), "ATST64");
        assert_eq!(at::set_timeout(0), "ATST01");
        assert_eq!(at::set_timeout(10_000), "ATSTFF");
    }

    proptest! {
        #[test]
        fn framer_yields_one_response_per_prompt(
            chunks in proptest::collection::vec("[0-9A-F \r]{0,12}", 1..8)
        ) {
            let mut framer = ResponseFramer::new();
            for chunk in &chunks {
                framer.push_bytes(chunk.as_bytes());
                framer.push_bytes(b">");
            }
            let mut count = 0;
            while let Some(frame) = framer.next_response() {
                prop_assert!(!frame.contains('>'));
                count += 1;
            }
            prop_assert_eq!(count, chunks.len());
        }
    }
}
