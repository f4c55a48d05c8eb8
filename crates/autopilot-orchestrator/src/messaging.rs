//! Outbound messaging provider seam.
//!
//! The control plane is not a message transport: it hands the composed body
//! to the provider and follows the delivery lifecycle through webhooks. The
//! HTTP implementation speaks a Twilio-shaped REST API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::info;

use autopilot_types::OutreachChannel;

#[derive(Debug, Clone)]
pub struct ProviderAck {
    pub provider_message_id: String,
}

/// Send failure classification. Only definitive provider verdicts count as
/// breaker errors; transient transport faults are retried by the queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("provider rejected the message: {0}")]
    Definitive(String),
    #[error("transient send failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Hand the message to the provider. The returned id keys all later
    /// status callbacks.
    async fn send(
        &self,
        channel: OutreachChannel,
        to_phone: &str,
        body: &str,
    ) -> Result<ProviderAck, SendError>;
}

pub struct HttpMessenger {
    base_url: String,
    auth_token: Option<String>,
    from_number: String,
    client: Client,
}

impl HttpMessenger {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
            from_number: from_number.into(),
            client: Client::new(),
        }
    }

    fn address_for(&self, channel: OutreachChannel, phone: &str) -> String {
        match channel {
            OutreachChannel::Whatsapp => format!("whatsapp:{phone}"),
            _ => phone.to_string(),
        }
    }
}

#[async_trait]
impl MessageProvider for HttpMessenger {
    async fn send(
        &self,
        channel: OutreachChannel,
        to_phone: &str,
        body: &str,
    ) -> Result<ProviderAck, SendError> {
        let url = format!("{}/Messages.json", self.base_url.trim_end_matches('/'));
        let params = [
            ("From", self.address_for(channel, &self.from_number)),
            ("To", self.address_for(channel, to_phone)),
            ("Body", body.to_string()),
        ];
        let mut request = self.client.post(&url).form(&params);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SendError::Transient(err.to_string()))?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|err| SendError::Transient(err.to_string()))?;

        if !status.is_success() {
            let detail = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("provider send failed");
            if status.is_server_error() {
                return Err(SendError::Transient(format!("{status}: {detail}")));
            }
            return Err(SendError::Definitive(format!("{status}: {detail}")));
        }

        let sid = value
            .get("sid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SendError::Definitive("provider ack missing message sid".to_string()))?;
        info!(channel = channel.as_str(), sid, "message_submitted");
        Ok(ProviderAck {
            provider_message_id: sid.to_string(),
        })
    }
}
