//! Human-support console ingestion.
//!
//! The console accepts the same webhook shape the router receives, so a
//! forwarded event looks to an agent like any other message from the contact.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::HumanSupportConfig;
use crate::error::ChannelError;
use crate::pipeline::types::InboundEvent;

/// Destination for conversations a person has to handle.
#[async_trait]
pub trait HumanSupport: Send + Sync {
    async fn forward(&self, event: &InboundEvent) -> Result<(), ChannelError>;
}

/// Posts events as JSON to the console's ingestion URL.
pub struct HttpHumanSupport {
    url: String,
    client: reqwest::Client,
}

impl HttpHumanSupport {
    pub fn new(config: &HumanSupportConfig) -> Result<Self, ChannelError> {
        Self::with_timeout(config.url.clone(), config.timeout)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl HumanSupport for HttpHumanSupport {
    async fn forward(&self, event: &InboundEvent) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "human_support".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "human_support".into(),
                reason: format!("ingestion returned {status}: {body}"),
            });
        }

        tracing::debug!(
            phone = %event.contact_phone(),
            message_id = %event.message_id(),
            "Event forwarded to human support"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_console_is_a_send_failure() {
        let support =
            HttpHumanSupport::with_timeout("http://127.0.0.1:9/ingest", Duration::from_millis(200))
                .unwrap();
        let event: InboundEvent = serde_json::from_value(serde_json::json!({
            "event": "message-received",
            "instanceId": "inst-1",
            "data": {
                "messageId": "m-1",
                "from": "5511",
                "to": "5522",
                "text": { "message": "oi" },
                "timestamp": 1,
                "fromMe": false
            }
        }))
        .unwrap();

        let err = support.forward(&event).await.unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed { ref name, .. } if name == "human_support"));
    }
}
