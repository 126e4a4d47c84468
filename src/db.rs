use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: Uuid,
    pub group_id: Uuid,

    pub name: String,
    /// `YYYY-MM-DD`, only month and day recur
    pub birthday: String,
    pub likes: Option<String>,
    pub gift_wishes: Option<String>,
    pub contact_number: Option<String>,

    /// set once an account claims this member
    pub user_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMember {
    pub name: String,
    pub birthday: String,
    pub likes: Option<String>,
    pub gift_wishes: Option<String>,
    pub contact_number: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        use MessageStatus::*;
        match self {
            Pending => "pending",
            Processing => "processing",
            Sent => "sent",
            Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use MessageStatus::*;
        match s {
            "pending" => Ok(Pending),
            "processing" => Ok(Processing),
            "sent" => Ok(Sent),
            "failed" => Ok(Failed),
            other => Err(anyhow::anyhow!("unknown message status {other:?}")),
        }
    }
}

/// One queued WhatsApp notification.
///
/// `sent_at` is set exactly when the status is terminal and `error_message`
/// exactly when it is `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub member_id: Uuid,

    pub recipient_number: String,
    pub template_name: String,
    /// kept as raw json, the dispatcher checks that it is a list
    pub template_parameters: Value,

    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: Uuid,
    pub member_id: Uuid,
    pub recipient_number: String,
    pub template_name: String,
    pub template_parameters: Vec<String>,
    /// rows sharing a key are only enqueued once
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub sent_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
}
