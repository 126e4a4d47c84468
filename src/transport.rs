use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{GetField, config::Config, templates::TemplateSpec};

/// What the provider said about one send attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub ok: bool,
    pub provider_message_id: Option<String>,
    pub error_text: Option<String>,
}

impl TransportResponse {
    pub fn accepted(provider_message_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            provider_message_id: Some(provider_message_id.into()),
            error_text: None,
        }
    }

    pub fn rejected(error_text: impl Into<String>) -> Self {
        Self {
            ok: false,
            provider_message_id: None,
            error_text: Some(error_text.into()),
        }
    }
}

/// The outbound messaging provider. An `Err` means the call itself broke
/// (network, bad response body); a provider refusal is `Ok` with `ok: false`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_template_message(
        &self,
        template: &TemplateSpec,
        recipient_number: &str,
        parameters: &[String],
    ) -> anyhow::Result<TransportResponse>;
}

#[derive(Serialize)]
struct TemplateRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    template: Value,
}

/// WhatsApp Cloud API client.
#[derive(Clone)]
pub struct WhatsAppTransport {
    http_client: reqwest::Client,
    messages_url: String,
    access_token: String,
}

impl WhatsAppTransport {
    pub fn new(api_url: &str, phone_number_id: &str, access_token: String, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            messages_url: format!("{}/{phone_number_id}/messages", api_url.trim_end_matches('/')),
            access_token,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.whatsapp_api_url,
            &config.whatsapp_phone_number_id,
            config.whatsapp_access_token.clone(),
            config.transport_timeout,
        )
    }
}

fn to_wa_id(recipient_number: &str) -> &str {
    recipient_number.trim_start_matches('+')
}

/// The provider's own error message when the body has one, otherwise the
/// status and the start of whatever came back.
fn rejection_text(status: StatusCode, text: &str) -> String {
    let provider_message = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|body| {
            body.get_obj_field("error")
                .and_then(|error| error.get_str_field("message"))
                .ok()
        })
        .filter(|message| !message.trim().is_empty());

    if let Some(message) = provider_message {
        return message;
    }

    let excerpt: String = text.trim().chars().take(200).collect();
    if excerpt.is_empty() {
        format!("provider returned {status}")
    } else {
        format!("provider returned {status}: {excerpt}")
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    async fn send_template_message(
        &self,
        template: &TemplateSpec,
        recipient_number: &str,
        parameters: &[String],
    ) -> anyhow::Result<TransportResponse> {
        let body_parameters: Vec<Value> = parameters
            .iter()
            .map(|text| json!({ "type": "text", "text": text }))
            .collect();

        let request = TemplateRequest {
            messaging_product: "whatsapp",
            to: to_wa_id(recipient_number),
            kind: "template",
            template: json!({
                "name": template.provider_id,
                "language": { "code": template.language },
                "components": [{ "type": "body", "parameters": body_parameters }],
            }),
        };

        let response = self.http_client.post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!(%status, body = %text, "whatsapp response");

        if !status.is_success() {
            return Ok(TransportResponse::rejected(rejection_text(status, &text)));
        }

        let body: Value = serde_json::from_str(&text)
            .with_context(|| format!("provider returned {status} with a non-json body"))?;
        let provider_message_id = body
            .get("messages")
            .and_then(|messages| messages.get(0))
            .ok_or_else(|| anyhow::anyhow!("expected messages in {body}"))?
            .get_str_field("id")?;

        Ok(TransportResponse::accepted(provider_message_id))
    }
}
