//! Control-channel wire format.
//!
//! Every frame is one UTF-8 JSON object with a `type` discriminator. Inbound
//! frames decode into [`ClientMessage`], outbound frames are built from
//! [`ServerMessage`]. Tunnel payloads travel base64-encoded because the
//! channel is text oriented.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SERVER_NAME: &str = "Unknown";
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
/// Bedrock's default LAN port.
pub const DEFAULT_SERVER_PORT: u16 = 19132;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("host must not be blank")]
    BlankHost,
}

/// Target game server descriptor. Serialized as `{name, ip, port}`; `host`
/// is accepted as an input alias for `ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McServer {
    pub name: String,
    #[serde(rename = "ip", alias = "host")]
    pub host: String,
    pub port: u16,
}

impl McServer {
    pub fn discovery_key(&self) -> String {
        crate::relay::net::target_addr(&self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

/// Payload of `register` and its aliases, also the body of `POST /servers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, alias = "userId", alias = "sessionId")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "ip")]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<PortValue>,
}

impl RegisterRequest {
    /// Applies defaults and validates. Returns the caller-supplied id (if any,
    /// trimmed and non-blank) and the target descriptor.
    pub fn into_target(self) -> Result<(Option<String>, McServer), RegisterError> {
        let id = self
            .id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let name = self
            .name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let host = match self.host {
            None => DEFAULT_SERVER_HOST.to_string(),
            Some(h) if h.trim().is_empty() => return Err(RegisterError::BlankHost),
            Some(h) => h.trim().to_string(),
        };

        let port = match self.port {
            None => DEFAULT_SERVER_PORT,
            Some(PortValue::Number(n)) => parse_port(n)?,
            Some(PortValue::Text(s)) => {
                let n: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| RegisterError::InvalidPort(s.clone()))?;
                parse_port(n)?
            }
        };

        Ok((id, McServer { name, host, port }))
    }
}

fn parse_port(n: i64) -> Result<u16, RegisterError> {
    match u16::try_from(n) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(RegisterError::InvalidPort(n.to_string())),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(alias = "register-server", alias = "create-session", alias = "lan-detected")]
    Register(RegisterRequest),
    List,
    JoinSession {
        id: String,
    },
    LeaveSession {
        id: String,
    },
    /// Client-originated tunnel bytes. `id` picks the session when the sender
    /// is joined to more than one.
    McData {
        #[serde(default)]
        id: Option<String>,
        data: String,
    },
    #[serde(other)]
    Unknown,
}

pub fn parse_client_frame(text: &str, max_bytes: usize) -> Result<ClientMessage, FrameError> {
    if text.len() > max_bytes {
        return Err(FrameError::TooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Row of the `list` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedServer {
    pub id: String,
    #[serde(flatten)]
    pub server: McServer,
    pub client_count: usize,
    pub created_at: u64,
}

/// Row of the `GET /servers` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub client_count: usize,
    pub mc_server: McServer,
    pub created_at: u64,
}

impl From<SessionSummary> for ListedServer {
    fn from(s: SessionSummary) -> Self {
        Self {
            id: s.id,
            server: s.mc_server,
            client_count: s.client_count,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Ok {
        message: String,
    },
    Created {
        id: String,
        mc_server: McServer,
    },
    List {
        servers: Vec<ListedServer>,
    },
    Joined {
        id: String,
        client_count: usize,
        mc_server: McServer,
    },
    ClientJoined {
        id: String,
        client_count: usize,
    },
    McData {
        id: String,
        data: String,
    },
    Error {
        message: String,
    },
    #[serde(rename = "listChanged")]
    ListChanged,
    SessionClosed {
        id: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn mc_data(session_id: &str, chunk: &[u8]) -> Self {
        ServerMessage::McData {
            id: session_id.to_string(),
            data: BASE64.encode(chunk),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ok { .. } => "ok",
            ServerMessage::Created { .. } => "created",
            ServerMessage::List { .. } => "list",
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::ClientJoined { .. } => "client-joined",
            ServerMessage::McData { .. } => "mc-data",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ListChanged => "listChanged",
            ServerMessage::SessionClosed { .. } => "session-closed",
        }
    }
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, FrameError> {
    Ok(BASE64.decode(data.trim())?)
}
