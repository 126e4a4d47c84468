//! Persistent store seams.
//!
//! Handlers and services only see these traits; [`SqliteStore`] is the
//! production implementation. Every mutation touches a single row.

mod sqlite;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{Group, Member, MessageStatus, NewMember, NewMessage, OutboundMessage, StatusUpdate};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn create_group(&self, name: &str) -> anyhow::Result<Group>;

    async fn get_group(&self, group_id: Uuid) -> anyhow::Result<Option<Group>>;

    async fn list_groups(&self) -> anyhow::Result<Vec<Group>>;

    /// Members of a group in the order they joined
    async fn list_members(&self, group_id: Uuid) -> anyhow::Result<Vec<Member>>;

    async fn get_member(&self, member_id: Uuid) -> anyhow::Result<Option<Member>>;

    async fn insert_member(&self, group_id: Uuid, member: NewMember) -> anyhow::Result<Member>;

    /// Attaches an account to a member. Returns false when the member doesn't
    /// exist or already belongs to a different account.
    async fn link_member(&self, member_id: Uuid, user_id: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Queues a message as `pending`. Returns `None` when a message with the
    /// same dedupe key already exists.
    async fn enqueue_message(&self, message: NewMessage) -> anyhow::Result<Option<OutboundMessage>>;

    async fn get_message(&self, message_id: Uuid) -> anyhow::Result<Option<OutboundMessage>>;

    /// Messages in `pending` or `processing`, in insertion order
    async fn list_pending_messages(&self) -> anyhow::Result<Vec<OutboundMessage>>;

    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        update: StatusUpdate,
    ) -> anyhow::Result<()>;

    /// Atomically moves a message from `expected` to `new`. Only one caller can
    /// win for a given `expected` state.
    async fn compare_and_set_status(
        &self,
        message_id: Uuid,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> anyhow::Result<bool>;

    /// Takes a message for sending and stamps the claim with `now`.
    ///
    /// Wins for a `pending` message, or for a `processing` one whose claim is
    /// missing or older than `stale_before`. Once claimed, nobody else can win
    /// until the claim goes stale.
    async fn claim_message(
        &self,
        message_id: Uuid,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> anyhow::Result<bool>;
}

#[cfg(test)]
pub(crate) use sqlite::tests as sqlite_tests;
