//! Error types for the engine

use std::fmt;

use obd_detect::ConnectStrategy;
use obd_protocol::{ObdProtocol, ParseError};
use thiserror::Error;

/// Errors returned by the command pipeline
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No terminal prompt before the deadline; the pipeline stays usable
    #[error("command {command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The pipeline was shut down before the command completed
    #[error("connection closed")]
    ConnectionClosed,

    /// The adapter link dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Why one connection strategy did not produce a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: ConnectStrategy,
    pub reason: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn list_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn list_protocols(protocols: &[ObdProtocol]) -> String {
    protocols
        .iter()
        .map(|p| format!("{} ({})", p.code(), p.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced by the connection supervisor
#[derive(Debug, Error)]
pub enum EngineError {
    /// The host has no usable transport
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Every strategy failed for this connect call
    #[error("could not open a channel to {device}; tried {}", list_failures(.failures))]
    ConnectionStrategyFailed {
        device: String,
        failures: Vec<StrategyFailure>,
    },

    /// The device used all its attempts; the caller must reset them to retry
    #[error("{device} used all {attempts} connection attempts; reset attempts to retry")]
    AttemptsExhausted { device: String, attempts: u32 },

    /// No protocol produced valid traffic
    #[error("no compatible protocol found; tried {}", list_protocols(.tried))]
    NegotiationFailed { tried: Vec<ObdProtocol> },

    /// A command timed out
    #[error("command {command} timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    /// The adapter link dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was closed while the request was pending
    #[error("connection closed")]
    ConnectionClosed,

    /// Commands are only accepted while ready or degraded
    #[error("not connected (state: {0})")]
    NotReady(&'static str),

    /// Another scan or connection attempt holds the supervisor
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Aborted by `disconnect()`
    #[error("cancelled by disconnect")]
    Cancelled,

    /// The response could not be decoded
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl From<CommandError> for EngineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout {
                command,
                timeout_ms,
            } => EngineError::CommandTimeout {
                command,
                timeout_ms,
            },
            CommandError::ConnectionClosed => EngineError::ConnectionClosed,
            CommandError::ConnectionLost(reason) => EngineError::ConnectionLost(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_failure_message_lists_strategies() {
        let err = EngineError::ConnectionStrategyFailed {
            device: "OBDII".into(),
            failures: vec![
                StrategyFailure {
                    strategy: ConnectStrategy::Insecure,
                    reason: "refused".into(),
                },
                StrategyFailure {
                    strategy: ConnectStrategy::Secure,
                    reason: "timed out after 20s".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "could not open a channel to OBDII; tried insecure: refused; secure: timed out after 20s"
        );
    }

    #[test]
    fn test_negotiation_message_lists_protocols() {
        let err = EngineError::NegotiationFailed {
            tried: vec![ObdProtocol::Can11Bit500k, ObdProtocol::Automatic],
        };
        assert!(err.to_string().contains("6 (ISO 15765-4 CAN (11 bit ID, 500 kbaud))"));
        assert!(err.to_string().contains("0 (Automatic)"));
    }
}
