use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

/// One application-level event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent: String,
    #[serde(default)]
    pub data: Value,
}

impl Intent {
    pub fn new(intent: impl Into<String>, data: Value) -> Self {
        Self {
            intent: intent.into(),
            data,
        }
    }
}

/// Correlation id for one acknowledged send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(String);

impl AckToken {
    /// Fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AckToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire frame exchanged in either direction over a link.
///
/// Intent frames serialize as `{"payload": [...], "isBatch": bool}` with an
/// optional `ackRequest`; ack replies serialize as `{"ackReply": token}` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<Intent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_batch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_request: Option<AckToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_reply: Option<AckToken>,
}

impl Frame {
    /// Intent frame; `isBatch` is set when more than one intent is carried.
    pub fn intents(payload: Vec<Intent>) -> Self {
        let is_batch = payload.len() > 1;
        Self {
            payload: Some(payload),
            is_batch: Some(is_batch),
            ack_request: None,
            ack_reply: None,
        }
    }

    /// Minimal frame answering an ack request.
    pub fn ack_reply(token: AckToken) -> Self {
        Self {
            ack_reply: Some(token),
            ..Self::default()
        }
    }

    pub fn with_ack_request(mut self, token: AckToken) -> Self {
        self.ack_request = Some(token);
        self
    }

    pub fn payload(&self) -> &[Intent] {
        self.payload.as_deref().unwrap_or(&[])
    }

    pub fn is_batch(&self) -> bool {
        self.is_batch.unwrap_or(false)
    }

    pub fn ack_request(&self) -> Option<&AckToken> {
        self.ack_request.as_ref()
    }

    pub fn ack_reply_token(&self) -> Option<&AckToken> {
        self.ack_reply.as_ref()
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(CoreError::from)
    }

    pub fn decode(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(CoreError::from)
    }
}
