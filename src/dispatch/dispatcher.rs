use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::{MessageStatus, OutboundMessage, StatusUpdate},
    store::MessageStore,
    templates::{TemplateRegistry, TemplateSpec},
    transport::Transport,
};

/// Why a message ended up `failed`. The display text is what gets stored in
/// `error_message`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid phone number format")]
    InvalidPhoneNumber,

    #[error("template parameters must be a list")]
    ParametersNotAList,

    #[error("template parameter {0} is not text")]
    ParameterNotText(usize),

    #[error("unknown template name: {0}")]
    UnknownTemplate(String),

    #[error("template {name} expects {expected} parameters, got {actual}")]
    ParameterCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// provider answered but refused, text kept verbatim
    #[error("{0}")]
    Rejected(String),

    #[error("transport timed out after {0}ms")]
    Timeout(u128),

    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Failed,
    /// another dispatcher holds a live claim on the message
    Skipped,
    /// the store broke mid-dispatch, the row's state is unknown
    Error,
}

/// Stored when a failure cause comes back blank.
const UNKNOWN_FAILURE: &str = "delivery failed without an error message";

/// Default age after which a `processing` claim may be taken over.
const DEFAULT_STALE_CLAIM_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub message_id: Uuid,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    fn sent(message_id: Uuid) -> Self {
        Self { message_id, status: DispatchStatus::Sent, error: None }
    }

    fn failed(message_id: Uuid, error: String) -> Self {
        Self { message_id, status: DispatchStatus::Failed, error: Some(error) }
    }

    fn skipped(message_id: Uuid) -> Self {
        Self { message_id, status: DispatchStatus::Skipped, error: None }
    }

    fn error(message_id: Uuid, error: String) -> Self {
        Self { message_id, status: DispatchStatus::Error, error: Some(error) }
    }
}

fn failure_text(text: String) -> String {
    if text.trim().is_empty() {
        UNKNOWN_FAILURE.to_owned()
    } else {
        text
    }
}

/// `+` then the country code and number, digits only.
fn is_valid_phone_number(number: &str) -> bool {
    number
        .strip_prefix('+')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Moves queued messages to `sent` or `failed`.
///
/// Each message gets at most one transport call per invocation. Failed
/// messages are never picked up again automatically. A message left in
/// `processing` is only taken over once its claim is older than
/// `stale_claim_after`.
#[derive(Clone)]
pub struct MessageDispatcher {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    templates: Arc<TemplateRegistry>,
    send_timeout: Duration,
    stale_claim_after: Duration,
}

impl MessageDispatcher {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        templates: Arc<TemplateRegistry>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            templates,
            send_timeout,
            stale_claim_after: DEFAULT_STALE_CLAIM_AFTER.max(send_timeout * 2),
        }
    }

    /// Never below twice the send timeout, so a live send can't go stale.
    pub fn with_stale_claim_after(mut self, stale_claim_after: Duration) -> Self {
        self.stale_claim_after = stale_claim_after.max(self.send_timeout * 2);
        self
    }

    /// Processes every `pending`/`processing` message in store order. An
    /// `Err` only means the queue itself could not be read; per message
    /// outcomes, store errors included, are in the returned results.
    pub async fn sweep(&self) -> anyhow::Result<Vec<DispatchResult>> {
        let queued = self.store.list_pending_messages().await?;
        info!(count = queued.len(), "sweeping outbound messages");

        let mut results = Vec::with_capacity(queued.len());
        for message in &queued {
            let result = match self.process(message).await {
                Ok(result) => result,
                Err(e) => {
                    error!(message_id = %message.id, "could not record dispatch: {e:#}");
                    DispatchResult::error(message.id, format!("{e:#}"))
                }
            };
            results.push(result);
        }

        Ok(results)
    }

    /// Processes a single message. `None` if it doesn't exist; messages that
    /// already reached a terminal state are reported without resending.
    pub async fn dispatch_one(&self, message_id: Uuid) -> anyhow::Result<Option<DispatchResult>> {
        let Some(message) = self.store.get_message(message_id).await? else {
            return Ok(None);
        };

        self.process(&message).await.map(Some)
    }

    async fn process(&self, message: &OutboundMessage) -> anyhow::Result<DispatchResult> {
        if message.status.is_terminal() {
            return Ok(match message.status {
                MessageStatus::Sent => DispatchResult::sent(message.id),
                _ => DispatchResult::failed(
                    message.id,
                    failure_text(message.error_message.clone().unwrap_or_default()),
                ),
            });
        }

        let claimed_at = OffsetDateTime::now_utc();
        let stale_before = claimed_at - self.stale_claim_after;
        if !self.store.claim_message(message.id, claimed_at, stale_before).await? {
            info!(message_id = %message.id, "message already claimed, skipping");
            return Ok(DispatchResult::skipped(message.id));
        }

        let outcome = match self.validate(message) {
            Ok((template, parameters)) => self.deliver(template, &message.recipient_number, &parameters).await,
            Err(e) => Err(e),
        };

        let now = OffsetDateTime::now_utc();
        match outcome {
            Ok(provider_message_id) => {
                self.store
                    .update_message_status(
                        message.id,
                        MessageStatus::Sent,
                        StatusUpdate {
                            sent_at: Some(now),
                            error_message: None,
                            provider_message_id,
                        },
                    )
                    .await?;

                info!(message_id = %message.id, template = %message.template_name, "message sent");
                Ok(DispatchResult::sent(message.id))
            }
            Err(e) => {
                let error_message = failure_text(e.to_string());
                self.store
                    .update_message_status(
                        message.id,
                        MessageStatus::Failed,
                        StatusUpdate {
                            sent_at: Some(now),
                            error_message: Some(error_message.clone()),
                            provider_message_id: None,
                        },
                    )
                    .await?;

                warn!(message_id = %message.id, template = %message.template_name, "message failed: {error_message}");
                Ok(DispatchResult::failed(message.id, error_message))
            }
        }
    }

    fn validate<'a>(&'a self, message: &OutboundMessage) -> Result<(&'a TemplateSpec, Vec<String>), DispatchError> {
        if !is_valid_phone_number(&message.recipient_number) {
            return Err(DispatchError::InvalidPhoneNumber);
        }

        let Value::Array(raw_parameters) = &message.template_parameters else {
            return Err(DispatchError::ParametersNotAList);
        };

        let parameters = raw_parameters
            .iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::String(text) => Ok(text.clone()),
                Value::Number(number) => Ok(number.to_string()),
                Value::Bool(flag) => Ok(flag.to_string()),
                _ => Err(DispatchError::ParameterNotText(index)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let template = self.templates
            .resolve(&message.template_name)
            .ok_or_else(|| DispatchError::UnknownTemplate(message.template_name.clone()))?;

        if template.parameter_count != parameters.len() {
            return Err(DispatchError::ParameterCount {
                name: message.template_name.clone(),
                expected: template.parameter_count,
                actual: parameters.len(),
            });
        }

        Ok((template, parameters))
    }

    /// Returns the provider's message id on success.
    async fn deliver(
        &self,
        template: &TemplateSpec,
        recipient_number: &str,
        parameters: &[String],
    ) -> Result<Option<String>, DispatchError> {
        let call = self.transport.send_template_message(template, recipient_number, parameters);

        match tokio::time::timeout(self.send_timeout, call).await {
            Err(_) => Err(DispatchError::Timeout(self.send_timeout.as_millis())),
            Ok(Err(e)) => Err(DispatchError::Transport(format!("{e:#}"))),
            Ok(Ok(response)) if response.ok => Ok(response.provider_message_id),
            Ok(Ok(response)) => Err(DispatchError::Rejected(
                response
                    .error_text
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| "provider rejected the message".to_owned()),
            )),
        }
    }
}
