use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{Group, Member, MessageStatus, NewMember, NewMessage, OutboundMessage, StatusUpdate};

use super::{MemberStore, MessageStore};

const MEMBER_COLUMNS: &str =
    "id,group_id,name,birthday,likes,gift_wishes,contact_number,user_id,created_at";
const MESSAGE_COLUMNS: &str =
    "id,group_id,member_id,recipient_number,template_name,template_parameters,status,error_message,provider_message_id,created_at,sent_at";

#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    created_at: OffsetDateTime,
}

impl TryFrom<GroupRow> for Group {
    type Error = anyhow::Error;

    fn try_from(row: GroupRow) -> anyhow::Result<Self> {
        Ok(Group {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    id: String,
    group_id: String,
    name: String,
    birthday: String,
    likes: Option<String>,
    gift_wishes: Option<String>,
    contact_number: Option<String>,
    user_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<MemberRow> for Member {
    type Error = anyhow::Error;

    fn try_from(row: MemberRow) -> anyhow::Result<Self> {
        Ok(Member {
            id: Uuid::parse_str(&row.id)?,
            group_id: Uuid::parse_str(&row.group_id)?,
            name: row.name,
            birthday: row.birthday,
            likes: row.likes,
            gift_wishes: row.gift_wishes,
            contact_number: row.contact_number,
            user_id: row.user_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    group_id: String,
    member_id: String,
    recipient_number: String,
    template_name: String,
    template_parameters: String,
    status: String,
    error_message: Option<String>,
    provider_message_id: Option<String>,
    created_at: OffsetDateTime,
    sent_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRow> for OutboundMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> anyhow::Result<Self> {
        // unparseable json stays a plain string, dispatch rejects it as not a list
        let template_parameters = serde_json::from_str(&row.template_parameters)
            .unwrap_or(Value::String(row.template_parameters));

        Ok(OutboundMessage {
            id: Uuid::parse_str(&row.id)?,
            group_id: Uuid::parse_str(&row.group_id)?,
            member_id: Uuid::parse_str(&row.member_id)?,
            recipient_number: row.recipient_number,
            template_name: row.template_name,
            template_parameters,
            status: row.status.parse()?,
            error_message: row.error_message,
            provider_message_id: row.provider_message_id,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

#[async_trait]
impl MemberStore for SqliteStore {
    async fn create_group(&self, name: &str) -> anyhow::Result<Group> {
        let group = Group {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        };

        sqlx::query("INSERT INTO groups (id,name,created_at) VALUES (?,?,?)")
            .bind(group.id.to_string())
            .bind(&group.name)
            .bind(group.created_at)
            .execute(&self.db_pool)
            .await?;

        Ok(group)
    }

    async fn get_group(&self, group_id: Uuid) -> anyhow::Result<Option<Group>> {
        sqlx::query_as::<_, GroupRow>("SELECT id,name,created_at FROM groups WHERE id=?")
            .bind(group_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .map(Group::try_from)
            .transpose()
    }

    async fn list_groups(&self) -> anyhow::Result<Vec<Group>> {
        sqlx::query_as::<_, GroupRow>("SELECT id,name,created_at FROM groups ORDER BY rowid")
            .fetch_all(&self.db_pool)
            .await?
            .into_iter()
            .map(Group::try_from)
            .collect()
    }

    async fn list_members(&self, group_id: Uuid) -> anyhow::Result<Vec<Member>> {
        sqlx::query_as::<_, MemberRow>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE group_id=? ORDER BY rowid"
        ))
            .bind(group_id.to_string())
            .fetch_all(&self.db_pool)
            .await?
            .into_iter()
            .map(Member::try_from)
            .collect()
    }

    async fn get_member(&self, member_id: Uuid) -> anyhow::Result<Option<Member>> {
        sqlx::query_as::<_, MemberRow>(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id=?"))
            .bind(member_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .map(Member::try_from)
            .transpose()
    }

    async fn insert_member(&self, group_id: Uuid, member: NewMember) -> anyhow::Result<Member> {
        let member = Member {
            id: Uuid::now_v7(),
            group_id,
            name: member.name,
            birthday: member.birthday,
            likes: member.likes,
            gift_wishes: member.gift_wishes,
            contact_number: member.contact_number,
            user_id: member.user_id,
            created_at: OffsetDateTime::now_utc(),
        };

        sqlx::query(&format!(
            "INSERT INTO members ({MEMBER_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?)"
        ))
            .bind(member.id.to_string())
            .bind(member.group_id.to_string())
            .bind(&member.name)
            .bind(&member.birthday)
            .bind(&member.likes)
            .bind(&member.gift_wishes)
            .bind(&member.contact_number)
            .bind(&member.user_id)
            .bind(member.created_at)
            .execute(&self.db_pool)
            .await?;

        Ok(member)
    }

    async fn link_member(&self, member_id: Uuid, user_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE members SET user_id=? WHERE id=? AND (user_id IS NULL OR user_id=?)",
        )
            .bind(user_id)
            .bind(member_id.to_string())
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn enqueue_message(&self, message: NewMessage) -> anyhow::Result<Option<OutboundMessage>> {
        let id = Uuid::now_v7();
        let created_at = OffsetDateTime::now_utc();
        let template_parameters = serde_json::to_string(&message.template_parameters)?;

        let result = sqlx::query(
            "INSERT INTO outbound_messages \
             (id,group_id,member_id,recipient_number,template_name,template_parameters,status,dedupe_key,created_at) \
             VALUES (?,?,?,?,?,?,?,?,?) \
             ON CONFLICT (dedupe_key) DO NOTHING",
        )
            .bind(id.to_string())
            .bind(message.group_id.to_string())
            .bind(message.member_id.to_string())
            .bind(&message.recipient_number)
            .bind(&message.template_name)
            .bind(&template_parameters)
            .bind(MessageStatus::Pending.as_str())
            .bind(&message.dedupe_key)
            .bind(created_at)
            .execute(&self.db_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(OutboundMessage {
            id,
            group_id: message.group_id,
            member_id: message.member_id,
            recipient_number: message.recipient_number,
            template_name: message.template_name,
            template_parameters: message.template_parameters.into(),
            status: MessageStatus::Pending,
            error_message: None,
            provider_message_id: None,
            created_at,
            sent_at: None,
        }))
    }

    async fn get_message(&self, message_id: Uuid) -> anyhow::Result<Option<OutboundMessage>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages WHERE id=?"
        ))
            .bind(message_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .map(OutboundMessage::try_from)
            .transpose()
    }

    async fn list_pending_messages(&self) -> anyhow::Result<Vec<OutboundMessage>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages WHERE status IN (?,?) ORDER BY rowid"
        ))
            .bind(MessageStatus::Pending.as_str())
            .bind(MessageStatus::Processing.as_str())
            .fetch_all(&self.db_pool)
            .await?
            .into_iter()
            .map(OutboundMessage::try_from)
            .collect()
    }

    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        update: StatusUpdate,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE outbound_messages SET status=?,sent_at=?,error_message=?,provider_message_id=? WHERE id=?",
        )
            .bind(status.as_str())
            .bind(update.sent_at)
            .bind(&update.error_message)
            .bind(&update.provider_message_id)
            .bind(message_id.to_string())
            .execute(&self.db_pool)
            .await?;

        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        message_id: Uuid,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE outbound_messages SET status=? WHERE id=? AND status=?")
            .bind(new.as_str())
            .bind(message_id.to_string())
            .bind(expected.as_str())
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_message(
        &self,
        message_id: Uuid,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE outbound_messages SET status=?,claimed_at=? \
             WHERE id=? AND (status=? OR (status=? AND (claimed_at IS NULL OR claimed_at<?)))",
        )
            .bind(MessageStatus::Processing.as_str())
            .bind(now.unix_timestamp())
            .bind(message_id.to_string())
            .bind(MessageStatus::Pending.as_str())
            .bind(MessageStatus::Processing.as_str())
            .bind(stale_before.unix_timestamp())
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::res::apply_schema;

    pub(crate) async fn memory_store() -> SqliteStore {
        // one connection, every in-memory connection is its own database
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&db_pool).await.unwrap();
        SqliteStore::new(db_pool)
    }

    pub(crate) fn new_message(recipient_number: &str, template_name: &str, params: &[&str]) -> NewMessage {
        NewMessage {
            group_id: Uuid::now_v7(),
            member_id: Uuid::now_v7(),
            recipient_number: recipient_number.to_owned(),
            template_name: template_name.to_owned(),
            template_parameters: params.iter().map(|p| p.to_string()).collect(),
            dedupe_key: None,
        }
    }

    fn new_member(name: &str, birthday: &str) -> NewMember {
        NewMember {
            name: name.to_owned(),
            birthday: birthday.to_owned(),
            likes: Some("chocolate".to_owned()),
            gift_wishes: None,
            contact_number: Some("+5491122223333".to_owned()),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn test_members_round_trip_in_join_order() {
        let store = memory_store().await;
        let group = store.create_group("Family").await.unwrap();
        let other = store.create_group("Work").await.unwrap();

        let ana = store.insert_member(group.id, new_member("Ana", "1990-08-05")).await.unwrap();
        store.insert_member(other.id, new_member("Bob", "1985-01-02")).await.unwrap();
        let caro = store.insert_member(group.id, new_member("Caro", "2000-02-29")).await.unwrap();

        let ids: Vec<Uuid> = store.list_members(group.id).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![ana.id, caro.id]);

        let loaded = store.get_member(ana.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Ana");
        assert_eq!(loaded.birthday, "1990-08-05");
        assert_eq!(loaded.likes.as_deref(), Some("chocolate"));
        assert_eq!(loaded.gift_wishes, None);
        assert_eq!(store.get_group(group.id).await.unwrap().unwrap().name, "Family");
        assert_eq!(store.list_groups().await.unwrap().len(), 2);
        assert!(store.get_group(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_member_once() {
        let store = memory_store().await;
        let group = store.create_group("Family").await.unwrap();
        let ana = store.insert_member(group.id, new_member("Ana", "1990-08-05")).await.unwrap();

        assert!(store.link_member(ana.id, "user-1").await.unwrap());
        assert!(store.link_member(ana.id, "user-1").await.unwrap());
        assert!(!store.link_member(ana.id, "user-2").await.unwrap());
        assert!(!store.link_member(Uuid::now_v7(), "user-1").await.unwrap());

        let ana = store.get_member(ana.id).await.unwrap().unwrap();
        assert_eq!(ana.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_on_key() {
        let store = memory_store().await;

        let mut message = new_message("+5491122223333", "welcome", &["Ana", "Family"]);
        message.dedupe_key = Some("welcome:ana".to_owned());

        let queued = store.enqueue_message(message.clone()).await.unwrap().unwrap();
        assert_eq!(queued.status, MessageStatus::Pending);
        assert!(store.enqueue_message(message).await.unwrap().is_none());

        // no key, no dedupe
        let plain = new_message("+5491122223333", "welcome", &["Ana", "Family"]);
        assert!(store.enqueue_message(plain.clone()).await.unwrap().is_some());
        assert!(store.enqueue_message(plain).await.unwrap().is_some());

        assert_eq!(store.list_pending_messages().await.unwrap().len(), 3);
        let loaded = store.get_message(queued.id).await.unwrap().unwrap();
        assert_eq!(loaded.template_parameters, serde_json::json!(["Ana", "Family"]));
        assert_eq!(loaded.recipient_number, queued.recipient_number);
    }

    #[tokio::test]
    async fn test_compare_and_set_status() {
        let store = memory_store().await;
        let queued = store
            .enqueue_message(new_message("+5491122223333", "welcome", &["Ana", "Family"]))
            .await
            .unwrap()
            .unwrap();

        assert!(store.compare_and_set_status(queued.id, MessageStatus::Pending, MessageStatus::Processing).await.unwrap());
        assert!(!store.compare_and_set_status(queued.id, MessageStatus::Pending, MessageStatus::Processing).await.unwrap());

        let now = OffsetDateTime::now_utc();
        store
            .update_message_status(
                queued.id,
                MessageStatus::Failed,
                StatusUpdate { sent_at: Some(now), error_message: Some("boom".to_owned()), provider_message_id: None },
            )
            .await
            .unwrap();

        let failed = store.get_message(queued.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.sent_at.is_some());
        assert!(store.list_pending_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_until_stale() {
        let store = memory_store().await;
        let queued = store
            .enqueue_message(new_message("+5491122223333", "welcome", &["Ana", "Family"]))
            .await
            .unwrap()
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let stale_before = now - time::Duration::minutes(5);

        assert!(store.claim_message(queued.id, now, stale_before).await.unwrap());
        assert!(!store.claim_message(queued.id, now, stale_before).await.unwrap());
        assert_eq!(store.get_message(queued.id).await.unwrap().unwrap().status, MessageStatus::Processing);

        // ten minutes on, the first claim has gone stale
        let later = now + time::Duration::minutes(10);
        assert!(store.claim_message(queued.id, later, later - time::Duration::minutes(5)).await.unwrap());
        assert!(!store.claim_message(queued.id, later, later - time::Duration::minutes(5)).await.unwrap());

        store
            .update_message_status(queued.id, MessageStatus::Sent, StatusUpdate { sent_at: Some(later), ..Default::default() })
            .await
            .unwrap();
        let far_later = later + time::Duration::days(1);
        assert!(!store.claim_message(queued.id, far_later, far_later).await.unwrap());
    }

    #[tokio::test]
    async fn test_unstamped_processing_rows_can_be_claimed_once() {
        let store = memory_store().await;
        let queued = store
            .enqueue_message(new_message("+5491122223333", "welcome", &["Ana", "Family"]))
            .await
            .unwrap()
            .unwrap();
        store.compare_and_set_status(queued.id, MessageStatus::Pending, MessageStatus::Processing).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let stale_before = now - time::Duration::minutes(5);
        assert!(store.claim_message(queued.id, now, stale_before).await.unwrap());
        assert!(!store.claim_message(queued.id, now, stale_before).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_parameters_survive_loading() {
        let store = memory_store().await;
        let queued = store
            .enqueue_message(new_message("+5491122223333", "welcome", &[]))
            .await
            .unwrap()
            .unwrap();

        sqlx::query("UPDATE outbound_messages SET template_parameters='Ana, Family' WHERE id=?")
            .bind(queued.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let loaded = store.get_message(queued.id).await.unwrap().unwrap();
        assert_eq!(loaded.template_parameters, Value::String("Ana, Family".to_owned()));
    }
}
