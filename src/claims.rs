//! Linking anonymous group joins to an account.
//!
//! Someone can join a group before signing in. The join leaves a
//! [`ClaimTicket`] in their server-side session; once they authenticate, the
//! client redeems the session's tickets and the members become theirs.

use std::sync::Arc;

use axum::{debug_handler, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_sessions::Session;
use tracing::info;
use uuid::Uuid;

use crate::{
    db::{Member, NewMessage},
    session::PENDING_CLAIMS,
    store::{MemberStore, MessageStore},
    templates::GROUP_CONFIRMATION,
    AppError, AppResult, AppState,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTicket {
    pub id: Uuid,
    pub group_id: Uuid,
    pub member_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ClaimTicket {
    pub fn issue(group_id: Uuid, member_id: Uuid, ttl: time::Duration, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::now_v7(),
            group_id,
            member_id,
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Adds a ticket to whatever the session already holds.
pub async fn remember_claim(session: &Session, ticket: ClaimTicket) -> AppResult<()> {
    let mut tickets = session
        .get::<Vec<ClaimTicket>>(PENDING_CLAIMS)
        .await?
        .unwrap_or_default();
    tickets.push(ticket);
    session.insert(PENDING_CLAIMS, tickets).await?;
    Ok(())
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub claimed: Vec<Uuid>,
    pub expired: Vec<Uuid>,
    /// already linked to another account
    pub rejected: Vec<Uuid>,
}

/// Links every live ticket's member to `user_id` and queues a group
/// confirmation for members that have a number.
///
/// Tickets are taken off the front of `tickets` as they are settled. On error
/// the ticket that failed and everything after it are left in place, and
/// redeeming them again is safe.
pub async fn redeem_tickets(
    members: &dyn MemberStore,
    messages: &dyn MessageStore,
    tickets: &mut Vec<ClaimTicket>,
    user_id: &str,
    now: OffsetDateTime,
) -> anyhow::Result<Redemption> {
    let mut redemption = Redemption::default();

    while let Some(ticket) = tickets.first() {
        redeem_one(members, messages, ticket, user_id, now, &mut redemption).await?;
        tickets.remove(0);
    }

    Ok(redemption)
}

async fn redeem_one(
    members: &dyn MemberStore,
    messages: &dyn MessageStore,
    ticket: &ClaimTicket,
    user_id: &str,
    now: OffsetDateTime,
    redemption: &mut Redemption,
) -> anyhow::Result<()> {
    if ticket.is_expired(now) {
        redemption.expired.push(ticket.member_id);
        return Ok(());
    }

    if !members.link_member(ticket.member_id, user_id).await? {
        redemption.rejected.push(ticket.member_id);
        return Ok(());
    }

    if let Some(member) = members.get_member(ticket.member_id).await? {
        confirm_membership(members, messages, &member).await?;
    }
    redemption.claimed.push(ticket.member_id);
    Ok(())
}

async fn confirm_membership(
    members: &dyn MemberStore,
    messages: &dyn MessageStore,
    member: &Member,
) -> anyhow::Result<()> {
    let Some(contact_number) = member.contact_number.clone() else {
        return Ok(());
    };
    let Some(group) = members.get_group(member.group_id).await? else {
        return Ok(());
    };

    messages
        .enqueue_message(NewMessage {
            group_id: group.id,
            member_id: member.id,
            recipient_number: contact_number,
            template_name: GROUP_CONFIRMATION.to_owned(),
            template_parameters: vec![group.name],
            dedupe_key: Some(format!("{GROUP_CONFIRMATION}:{}", member.id)),
        })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RedeemRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RedeemResponse {
    success: bool,
    #[serde(flatten)]
    redemption: Redemption,
}

#[debug_handler(state = AppState)]
pub(crate) async fn redeem(
    State(members): State<Arc<dyn MemberStore>>,
    State(messages): State<Arc<dyn MessageStore>>,
    session: Session,
    Json(RedeemRequest { user_id }): Json<RedeemRequest>,
) -> AppResult<Json<RedeemResponse>> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::bad_request("userId must not be empty"));
    }

    let mut tickets = session
        .get::<Vec<ClaimTicket>>(PENDING_CLAIMS)
        .await?
        .unwrap_or_default();

    let redeemed = redeem_tickets(
        members.as_ref(),
        messages.as_ref(),
        &mut tickets,
        user_id,
        OffsetDateTime::now_utc(),
    )
    .await;

    // whatever wasn't settled stays for the next attempt
    if tickets.is_empty() {
        session.remove::<Vec<ClaimTicket>>(PENDING_CLAIMS).await?;
    } else {
        session.insert(PENDING_CLAIMS, &tickets).await?;
    }
    let redemption = redeemed?;

    info!(%user_id, claimed = redemption.claimed.len(), expired = redemption.expired.len(), "redeemed claim tickets");
    Ok(Json(RedeemResponse { success: true, redemption }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/claims/redeem", post(redeem))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        db::{Group, MessageStatus, NewMember},
        store::{SqliteStore, sqlite_tests::memory_store},
    };

    fn new_member(name: &str, contact_number: Option<&str>) -> NewMember {
        NewMember {
            name: name.to_owned(),
            birthday: "1990-08-05".to_owned(),
            likes: None,
            gift_wishes: None,
            contact_number: contact_number.map(str::to_owned),
            user_id: None,
        }
    }

    #[test]
    fn test_ticket_expiry() {
        let now = OffsetDateTime::now_utc();
        let ticket = ClaimTicket::issue(Uuid::now_v7(), Uuid::now_v7(), time::Duration::minutes(10), now);

        assert!(!ticket.is_expired(now));
        assert!(!ticket.is_expired(now + time::Duration::minutes(9)));
        assert!(ticket.is_expired(now + time::Duration::minutes(10)));
    }

    #[test]
    fn test_ticket_serializes_for_the_session() {
        let now = time::macros::datetime!(2024-08-05 12:00 UTC);
        let ticket = ClaimTicket::issue(Uuid::nil(), Uuid::nil(), time::Duration::hours(1), now);

        let json = serde_json::to_value(&ticket).unwrap();
        assert_eq!(json["expiresAt"], "2024-08-05T13:00:00Z");
        assert_eq!(serde_json::from_value::<ClaimTicket>(json).unwrap(), ticket);
    }

    #[tokio::test]
    async fn test_redeem_links_live_tickets_only() {
        let store = memory_store().await;
        let group = store.create_group("Family").await.unwrap();
        let ana = store.insert_member(group.id, new_member("Ana", Some("+5491122223333"))).await.unwrap();
        let bob = store.insert_member(group.id, new_member("Bob", None)).await.unwrap();
        let caro = store.insert_member(group.id, new_member("Caro", Some("+5491144445555"))).await.unwrap();
        store.link_member(caro.id, "someone-else").await.unwrap();

        let now = OffsetDateTime::now_utc();
        let hour = time::Duration::hours(1);
        let mut tickets = vec![
            ClaimTicket::issue(group.id, ana.id, hour, now),
            ClaimTicket::issue(group.id, bob.id, hour, now - time::Duration::hours(2)),
            ClaimTicket::issue(group.id, caro.id, hour, now),
        ];

        let redemption = redeem_tickets(&store, &store, &mut tickets, "user-1", now).await.unwrap();
        assert!(tickets.is_empty());
        assert_eq!(
            redemption,
            Redemption { claimed: vec![ana.id], expired: vec![bob.id], rejected: vec![caro.id] }
        );

        assert_eq!(store.get_member(ana.id).await.unwrap().unwrap().user_id.as_deref(), Some("user-1"));
        assert_eq!(store.get_member(bob.id).await.unwrap().unwrap().user_id, None);

        let queued = store.list_pending_messages().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].template_name, GROUP_CONFIRMATION);
        assert_eq!(queued[0].recipient_number, "+5491122223333");
        assert_eq!(queued[0].template_parameters, serde_json::json!(["Family"]));
        assert_eq!(queued[0].status, MessageStatus::Pending);
    }

    /// Fails to link one particular member, everything else goes through.
    struct FlakyMembers {
        inner: SqliteStore,
        broken: Uuid,
    }

    #[async_trait]
    impl MemberStore for FlakyMembers {
        async fn create_group(&self, name: &str) -> anyhow::Result<Group> {
            self.inner.create_group(name).await
        }

        async fn get_group(&self, group_id: Uuid) -> anyhow::Result<Option<Group>> {
            self.inner.get_group(group_id).await
        }

        async fn list_groups(&self) -> anyhow::Result<Vec<Group>> {
            self.inner.list_groups().await
        }

        async fn list_members(&self, group_id: Uuid) -> anyhow::Result<Vec<Member>> {
            self.inner.list_members(group_id).await
        }

        async fn get_member(&self, member_id: Uuid) -> anyhow::Result<Option<Member>> {
            self.inner.get_member(member_id).await
        }

        async fn insert_member(&self, group_id: Uuid, member: NewMember) -> anyhow::Result<Member> {
            self.inner.insert_member(group_id, member).await
        }

        async fn link_member(&self, member_id: Uuid, user_id: &str) -> anyhow::Result<bool> {
            if member_id == self.broken {
                return Err(anyhow::anyhow!("connection reset"));
            }
            self.inner.link_member(member_id, user_id).await
        }
    }

    #[tokio::test]
    async fn test_store_error_keeps_unsettled_tickets() {
        let store = memory_store().await;
        let group = store.create_group("Family").await.unwrap();
        let ana = store.insert_member(group.id, new_member("Ana", Some("+5491122223333"))).await.unwrap();
        let bob = store.insert_member(group.id, new_member("Bob", None)).await.unwrap();
        let caro = store.insert_member(group.id, new_member("Caro", None)).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let hour = time::Duration::hours(1);
        let mut tickets = vec![
            ClaimTicket::issue(group.id, ana.id, hour, now),
            ClaimTicket::issue(group.id, bob.id, hour, now),
            ClaimTicket::issue(group.id, caro.id, hour, now),
        ];
        let flaky = FlakyMembers { inner: store.clone(), broken: bob.id };

        assert!(redeem_tickets(&flaky, &store, &mut tickets, "user-1", now).await.is_err());
        assert_eq!(tickets.iter().map(|t| t.member_id).collect::<Vec<_>>(), vec![bob.id, caro.id]);
        assert_eq!(store.get_member(ana.id).await.unwrap().unwrap().user_id.as_deref(), Some("user-1"));

        let retried = redeem_tickets(&store, &store, &mut tickets, "user-1", now).await.unwrap();
        assert_eq!(retried.claimed, vec![bob.id, caro.id]);
        assert!(tickets.is_empty());
        assert_eq!(store.list_pending_messages().await.unwrap().len(), 1);
    }
}
