use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{message_types, ConfigSync};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Restart,
    UpdateConfig,
    HealthCheck,
}

impl NodeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCommand::Restart => "restart",
            NodeCommand::UpdateConfig => "update_config",
            NodeCommand::HealthCheck => "health_check",
        }
    }
}

/// A control message from the central server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ConfigUpdate(ConfigSync),
    NodeCommand {
        id: String,
        command: NodeCommand,
        params: Value,
    },
    HealthCheckRequest {
        id: String,
    },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("unknown node command {0:?}")]
    UnknownCommand(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawCommand {
    command: String,
    #[serde(default)]
    params: Value,
}

pub fn parse_inbound(text: &str) -> Result<InboundMessage, MessageError> {
    let envelope: RawEnvelope = serde_json::from_str(text)?;
    let id = envelope.id.unwrap_or_default();
    let invalid = |source| MessageError::InvalidPayload {
        kind: envelope.kind.clone(),
        source,
    };

    match envelope.kind.as_str() {
        message_types::CONFIG_UPDATE => {
            let config = serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            Ok(InboundMessage::ConfigUpdate(config))
        }
        message_types::NODE_COMMAND => {
            let raw: RawCommand = serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            let command = match raw.command.as_str() {
                "restart" => NodeCommand::Restart,
                "update_config" => NodeCommand::UpdateConfig,
                "health_check" => NodeCommand::HealthCheck,
                other => return Err(MessageError::UnknownCommand(other.to_string())),
            };
            Ok(InboundMessage::NodeCommand {
                id,
                command,
                params: raw.params,
            })
        }
        message_types::HEALTH_CHECK_REQUEST => Ok(InboundMessage::HealthCheckRequest { id }),
        other => Err(MessageError::UnknownType(other.to_string())),
    }
}
