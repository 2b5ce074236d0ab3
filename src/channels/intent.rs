//! Transport-agnostic outbound message descriptions.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ChannelError;
use crate::pipeline::validator::normalize_phone;

/// Kind of outbound message. Each kind has a fixed field contract on `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Audio,
    Video,
    ButtonList,
    List,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ButtonList => "button-list",
            Self::List => "list",
        }
    }

    /// Fields that must be present in `data` for this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Text => &["message"],
            Self::Image => &["image", "caption"],
            Self::Document => &["document", "fileName"],
            Self::Audio => &["audio"],
            Self::Video => &["video", "caption"],
            Self::ButtonList => &["message", "buttons"],
            Self::List => &["message", "buttonText", "sections"],
        }
    }
}

impl FromStr for MessageType {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "button-list" => Ok(Self::ButtonList),
            "list" => Ok(Self::List),
            other => Err(ChannelError::UnsupportedMessageType(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound message to be sent, produced and consumed within one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageIntent {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "phone")]
    pub target_phone: String,
    pub data: Value,
}

impl MessageIntent {
    pub fn new(message_type: MessageType, target_phone: impl Into<String>, data: Value) -> Self {
        Self {
            message_type,
            target_phone: target_phone.into(),
            data,
        }
    }

    pub fn text(target_phone: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Text,
            target_phone,
            json!({ "message": message.into() }),
        )
    }

    /// Parse an untyped `{type, phone, data}` send request.
    ///
    /// An unknown `type` fails with `UnsupportedMessageType`; a missing field of
    /// the type's contract fails with `InvalidIntent`.
    pub fn from_request(raw: &Value) -> Result<Self, ChannelError> {
        let type_str = raw.get("type").and_then(Value::as_str).ok_or_else(|| {
            ChannelError::UnsupportedMessageType("<missing>".to_string())
        })?;
        let message_type: MessageType = type_str.parse()?;

        let phone = raw
            .get("phone")
            .and_then(Value::as_str)
            .map(normalize_phone)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ChannelError::InvalidIntent {
                message_type: message_type.to_string(),
                reason: "phone is required".to_string(),
            })?;

        let data = raw.get("data").cloned().unwrap_or_else(|| json!({}));
        let intent = Self::new(message_type, phone, data);
        intent.validate()?;
        Ok(intent)
    }

    /// Check `data` against the field contract of the message type.
    pub fn validate(&self) -> Result<(), ChannelError> {
        let Some(data) = self.data.as_object() else {
            return Err(ChannelError::InvalidIntent {
                message_type: self.message_type.to_string(),
                reason: "data must be an object".to_string(),
            });
        };

        let missing: Vec<&str> = self
            .message_type
            .required_fields()
            .iter()
            .copied()
            .filter(|field| data.get(*field).is_none_or(Value::is_null))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::InvalidIntent {
                message_type: self.message_type.to_string(),
                reason: format!("missing fields: {}", missing.join(", ")),
            })
        }
    }

    /// Text body, for text intents.
    pub fn message_text(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}
