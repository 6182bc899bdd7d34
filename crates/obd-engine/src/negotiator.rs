//! Protocol negotiation
//!
//! Resets the adapter, runs the configuration sequence, then looks for a bus
//! protocol the vehicle answers on. Explicit candidates are tried in order
//! and accepted once enough probe PIDs return hex data; if none qualifies,
//! the adapter's automatic search gets one chance with a lower bar.

use obd_protocol::elm::at;
use obd_protocol::{adapter_error, is_hex_payload, ObdProtocol};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::{CommandError, EngineError};
use crate::pipeline::CommandPipeline;
use crate::state::NegotiatedProtocol;

/// Result of a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub protocol: NegotiatedProtocol,
    /// Identity reported by `ATZ`/`ATI`, e.g. `ELM327 v1.5`
    pub adapter_version: Option<String>,
    /// Candidates rejected before the chosen one, in the order tried
    pub rejected: Vec<ObdProtocol>,
}

pub struct ProtocolNegotiator {
    config: NegotiatorConfig,
}

/// Link-level failures abort negotiation; anything else is a failed probe
fn link_failure(err: CommandError) -> Result<(), EngineError> {
    match err {
        CommandError::Timeout { .. } => Ok(()),
        other => Err(other.into()),
    }
}

fn identity_line(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find(|line| line.to_ascii_uppercase().contains("ELM") || line.contains(" v"))
        .map(str::to_string)
}

impl ProtocolNegotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self { config }
    }

    pub async fn negotiate(
        &self,
        pipeline: &CommandPipeline,
    ) -> Result<NegotiationOutcome, EngineError> {
        let mut adapter_version = self.initialize(pipeline).await?;

        if let Some(version) = self.identify(pipeline).await? {
            adapter_version = Some(version);
        }
        match &adapter_version {
            Some(version) => info!("Adapter identifies as {}", version),
            None => debug!("Adapter did not report an identity"),
        }

        let mut rejected = Vec::new();
        for candidate in &self.config.candidates {
            if self
                .try_protocol(pipeline, *candidate, self.config.explicit_threshold)
                .await?
            {
                info!("Selected protocol {} ({})", candidate.code(), candidate.name());
                return Ok(NegotiationOutcome {
                    protocol: NegotiatedProtocol::explicit(*candidate),
                    adapter_version,
                    rejected,
                });
            }
            rejected.push(*candidate);
        }

        debug!("No explicit candidate answered; trying automatic search");
        if self
            .try_protocol(pipeline, ObdProtocol::Automatic, self.config.automatic_threshold)
            .await?
        {
            let resolved = self.resolved_protocol(pipeline).await?;
            info!(
                "Automatic search settled on {} ({})",
                resolved.code(),
                resolved.name()
            );
            return Ok(NegotiationOutcome {
                protocol: NegotiatedProtocol::automatic(resolved),
                adapter_version,
                rejected,
            });
        }

        rejected.push(ObdProtocol::Automatic);
        warn!("No compatible protocol after {} candidate(s)", rejected.len());
        Err(EngineError::NegotiationFailed { tried: rejected })
    }

    /// Reset and configuration sequence; individual failures are logged only
    async fn initialize(&self, pipeline: &CommandPipeline) -> Result<Option<String>, EngineError> {
        let mut version = None;
        match pipeline.submit(at::RESET, self.config.reset_timeout()).await {
            Ok(response) => version = identity_line(&response),
            Err(e) => {
                warn!("Reset failed: {}", e);
                link_failure(e)?;
            }
        }
        sleep(self.config.reset_settle()).await;

        for command in self.config.init_commands() {
            match pipeline.submit(&command, self.config.init_timeout()).await {
                Ok(response) => match adapter_error(&response) {
                    Some(error) => warn!("{} rejected by adapter: {}", command, error),
                    None => debug!("{} -> {}", command, response),
                },
                Err(e) => {
                    warn!("{} failed: {}", command, e);
                    link_failure(e)?;
                }
            }
        }
        Ok(version)
    }

    async fn identify(&self, pipeline: &CommandPipeline) -> Result<Option<String>, EngineError> {
        match pipeline.submit(at::IDENTIFY, self.config.init_timeout()).await {
            Ok(response) if adapter_error(&response).is_none() => {
                Ok(identity_line(&response).or_else(|| {
                    let trimmed = response.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                }))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                link_failure(e)?;
                Ok(None)
            }
        }
    }

    /// Select `protocol` and count valid probe answers
    async fn try_protocol(
        &self,
        pipeline: &CommandPipeline,
        protocol: ObdProtocol,
        threshold: usize,
    ) -> Result<bool, EngineError> {
        let select = protocol.select_command();
        match pipeline.submit(&select, self.config.init_timeout()).await {
            Ok(response) if adapter_error(&response).is_some() => {
                debug!("{} refused: {}", select, response);
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{} failed: {}", select, e);
                link_failure(e)?;
                return Ok(false);
            }
        }
        sleep(self.config.settle()).await;

        let mut valid = 0;
        for (index, probe) in self.config.probes.iter().enumerate() {
            // Stop once the threshold is out of reach
            if valid + (self.config.probes.len() - index) < threshold {
                break;
            }
            match pipeline.submit(probe, self.config.probe_timeout()).await {
                Ok(response) if is_hex_payload(&response) => {
                    valid += 1;
                    debug!("{} on protocol {}: {}", probe, protocol.code(), response);
                    if valid >= threshold {
                        return Ok(true);
                    }
                }
                Ok(response) => debug!("{} on protocol {}: {}", probe, protocol.code(), response),
                Err(e) => {
                    debug!("{} on protocol {} failed: {}", probe, protocol.code(), e);
                    link_failure(e)?;
                }
            }
        }
        debug!(
            "Protocol {} rejected ({}/{} valid probes, need {})",
            protocol.code(),
            valid,
            self.config.probes.len(),
            threshold
        );
        Ok(false)
    }

    /// Ask which protocol the automatic search found
    async fn resolved_protocol(&self, pipeline: &CommandPipeline) -> Result<ObdProtocol, EngineError> {
        match pipeline
            .submit(at::DESCRIBE_PROTOCOL_NUMBER, self.config.init_timeout())
            .await
        {
            Ok(response) => match ObdProtocol::from_dpn_response(&response) {
                Ok(protocol) => Ok(protocol),
                Err(e) => {
                    warn!("Could not read the automatic protocol: {}", e);
                    Ok(ObdProtocol::Automatic)
                }
            },
            Err(e) => {
                link_failure(e)?;
                Ok(ObdProtocol::Automatic)
            }
        }
    }
}
