//! WhatsApp messaging API transport.
//!
//! `POST {base}/{instance}/{endpoint}` with a bearer token and the JSON body
//! built by [`OutboundRequest`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::sender::{OutboundRequest, Transport};
use crate::config::TransportConfig;
use crate::error::ChannelError;

pub struct WhatsAppTransport {
    base_url: String,
    instance_id: String,
    token: SecretString,
    client: reqwest::Client,
}

impl WhatsAppTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            instance_id: config.instance_id.clone(),
            token: config.api_token.clone(),
            client,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}/{endpoint}", self.base_url, self.instance_id)
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn deliver(&self, request: &OutboundRequest) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url(request.endpoint))
            .bearer_auth(self.token.expose_secret())
            .json(&request.body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: format!("{} returned {status}: {body}", request.endpoint),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn url_joins_base_instance_and_endpoint() {
        let transport = WhatsAppTransport::new(&TransportConfig {
            api_url: "https://api.example.com/v1/".into(),
            instance_id: "inst-9".into(),
            api_token: SecretString::from("t"),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            transport.api_url("send-option-list"),
            "https://api.example.com/v1/inst-9/send-option-list"
        );
    }
}
