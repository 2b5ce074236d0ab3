//! Outbound message dispatch.
//!
//! [`MessageSender`] turns a [`MessageIntent`] into the transport's request
//! shape and hands it to a [`Transport`]. Send failures are reported to the
//! caller; they never touch persisted conversation state.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::channels::intent::{MessageIntent, MessageType};
use crate::error::ChannelError;

/// A request ready for the messaging API: endpoint name plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub endpoint: &'static str,
    /// `{phone, ...data}`.
    pub body: Value,
}

impl OutboundRequest {
    /// Validate an intent and build its request.
    pub fn from_intent(intent: &MessageIntent) -> Result<Self, ChannelError> {
        intent.validate()?;

        let mut body = Map::new();
        body.insert("phone".into(), Value::String(intent.target_phone.clone()));
        if let Some(data) = intent.data.as_object() {
            for (key, value) in data {
                if key != "phone" {
                    body.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(Self {
            endpoint: endpoint_for(intent.message_type),
            body: Value::Object(body),
        })
    }

    pub fn phone(&self) -> &str {
        self.body.get("phone").and_then(Value::as_str).unwrap_or("")
    }
}

/// API endpoint for each message type.
pub fn endpoint_for(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Text => "send-text",
        MessageType::Image => "send-image",
        MessageType::Document => "send-document",
        MessageType::Audio => "send-audio",
        MessageType::Video => "send-video",
        MessageType::ButtonList => "send-button-list",
        MessageType::List => "send-option-list",
    }
}

/// Delivers outbound requests to a messaging provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs and errors.
    fn name(&self) -> &str;

    async fn deliver(&self, request: &OutboundRequest) -> Result<(), ChannelError>;
}

/// Result of sending a batch of intents.
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: usize,
    pub failures: Vec<ChannelError>,
}

impl SendReport {
    pub fn all_sent(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sends [`MessageIntent`]s through a [`Transport`].
#[derive(Clone)]
pub struct MessageSender {
    transport: Arc<dyn Transport>,
}

impl MessageSender {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn send(&self, intent: &MessageIntent) -> Result<(), ChannelError> {
        let request = OutboundRequest::from_intent(intent)?;
        self.transport.deliver(&request).await?;
        debug!(
            transport = self.transport.name(),
            endpoint = request.endpoint,
            phone = %intent.target_phone,
            "Message sent"
        );
        Ok(())
    }

    /// Send intents in order. A failure is logged and the rest still go out.
    pub async fn send_all(&self, intents: &[MessageIntent]) -> SendReport {
        let mut report = SendReport::default();
        for intent in intents {
            match self.send(intent).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    error!(
                        error = %e,
                        message_type = %intent.message_type,
                        phone = %intent.target_phone,
                        "Failed to send message"
                    );
                    report.failures.push(e);
                }
            }
        }
        if !intents.is_empty() {
            info!(
                sent = report.sent,
                failed = report.failures.len(),
                "Outbound messages dispatched"
            );
        }
        report
    }
}
