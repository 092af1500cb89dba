//! Command wire format (§6.3): a JSON object with exactly one non-null key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptCommand {
    pub address: String,
    pub id: String,
    #[serde(default, rename = "connectHeaders", skip_serializing_if = "HashMap::is_empty")]
    pub connect_headers: HashMap<String, String>,
    #[serde(default, rename = "remoteEndpoint", skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<RemoteEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub id: String,
    #[serde(rename = "requestTarget")]
    pub request_target: String,
    pub method: String,
    #[serde(default, rename = "remoteEndpoint", skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<RemoteEndpoint>,
    #[serde(default, rename = "requestHeaders", skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseCommand {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(rename = "statusDescription")]
    pub status_description: String,
    #[serde(default, rename = "responseHeaders", skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    pub body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenewTokenCommand {
    pub token: String,
}

/// Raw wire shape: one non-null key among four. Kept distinct from
/// [`Command`] so serde can own the "exactly one of four optional fields"
/// representation without an untagged-enum ambiguity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CommandWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accept: Option<AcceptCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<RequestCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<ResponseCommand>,
    #[serde(default, rename = "renewToken", skip_serializing_if = "Option::is_none")]
    renew_token: Option<RenewTokenCommand>,
}

/// A fully assembled command frame, as dispatched by the control connection
/// receive pump (§4.3) or emitted by a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Accept(AcceptCommand),
    Request(RequestCommand),
    Response(ResponseCommand),
    RenewToken(RenewTokenCommand),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command JSON did not contain exactly one recognized key")]
    NotExactlyOne,
    #[error("invalid command JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Command {
    pub fn to_json(&self) -> Result<String, CommandError> {
        let wire = match self.clone() {
            Command::Accept(c) => CommandWire { accept: Some(c), ..Default::default() },
            Command::Request(c) => CommandWire { request: Some(c), ..Default::default() },
            Command::Response(c) => CommandWire { response: Some(c), ..Default::default() },
            Command::RenewToken(c) => CommandWire { renew_token: Some(c), ..Default::default() },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CommandError> {
        let wire: CommandWire = serde_json::from_str(text)?;
        wire.try_into()
    }
}

impl TryFrom<CommandWire> for Command {
    type Error = CommandError;

    fn try_from(wire: CommandWire) -> Result<Self, Self::Error> {
        let present = [
            wire.accept.is_some(),
            wire.request.is_some(),
            wire.response.is_some(),
            wire.renew_token.is_some(),
        ]
        .into_iter()
        .filter(|p| *p)
        .count();

        if present != 1 {
            return Err(CommandError::NotExactlyOne);
        }

        if let Some(c) = wire.accept {
            return Ok(Command::Accept(c));
        }
        if let Some(c) = wire.request {
            return Ok(Command::Request(c));
        }
        if let Some(c) = wire.response {
            return Ok(Command::Response(c));
        }
        if let Some(c) = wire.renew_token {
            return Ok(Command::RenewToken(c));
        }
        unreachable!("present count checked above")
    }
}
