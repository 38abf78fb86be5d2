//! JSON frames exchanged over the real-time coherence channel.
//!
//! Every frame is an object whose `type` field names the message kind.

use crate::domain::model::{CoherenceSnapshot, Trend};
use crate::utils::error::{PortalError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceUpdatePayload {
    pub client_id: String,
    pub current: f64,
    pub derivative: f64,
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl CoherenceUpdatePayload {
    pub fn snapshot(&self) -> CoherenceSnapshot {
        CoherenceSnapshot {
            current: self.current,
            derivative: self.derivative,
            trend: self.trend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceAlertPayload {
    pub client_id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Auth {
        token: String,
    },
    Ping,
    SubscribeClient {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    UnsubscribeClient {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    SubscribeAllClients,
    CoherenceUpdate {
        payload: CoherenceUpdatePayload,
    },
}

impl OutboundMessage {
    /// 認證完成前允許送出的訊息
    pub fn allowed_before_auth(&self) -> bool {
        matches!(self, OutboundMessage::Auth { .. } | OutboundMessage::Ping)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    AuthSuccess,
    AuthError {
        message: String,
    },
    CoherenceUpdate {
        payload: CoherenceUpdatePayload,
    },
    CoherenceAlert {
        payload: CoherenceAlertPayload,
    },
    ClientConnected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    ClientDisconnected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Pong,
}

const INBOUND_KINDS: [&str; 7] = [
    "auth_success",
    "auth_error",
    "coherence_update",
    "coherence_alert",
    "client_connected",
    "client_disconnected",
    "pong",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundMessage),
    /// 不認得的訊息種類，呼叫端記錄後忽略
    Unknown(String),
}

pub fn decode_inbound(text: &str) -> Result<Decoded> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PortalError::ChannelError {
            message: "Frame has no 'type' field".to_string(),
        })?
        .to_string();

    if !INBOUND_KINDS.contains(&kind.as_str()) {
        return Ok(Decoded::Unknown(kind));
    }

    let message: InboundMessage = serde_json::from_value(value)?;
    Ok(Decoded::Message(message))
}
