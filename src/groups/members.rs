use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_sessions::Session;
use tracing::info;
use uuid::Uuid;

use crate::{
    claims::{remember_claim, ClaimTicket},
    db::{Group, Member, NewMember, NewMessage},
    proximity,
    store::{MemberStore, MessageStore},
    templates::WELCOME,
    AppError, AppResult, AppState, Policy,
};

#[derive(Debug, Deserialize)]
pub(crate) struct NewGroupRequest {
    name: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_group(
    State(members): State<Arc<dyn MemberStore>>,
    Json(NewGroupRequest { name }): Json<NewGroupRequest>,
) -> AppResult<(StatusCode, Json<Group>)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("group name must not be empty"));
    }

    let group = members.create_group(name).await?;
    info!(group_id = %group.id, "created group {name}");
    Ok((StatusCode::CREATED, Json(group)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(
    Path(group_id): Path<Uuid>,
    State(members): State<Arc<dyn MemberStore>>,
) -> AppResult<Json<Vec<Member>>> {
    if members.get_group(group_id).await?.is_none() {
        return Err(AppError::not_found(format!("group {group_id}")));
    }

    Ok(Json(members.list_members(group_id).await?))
}

/// Adds a member to a group and, when they left a number, queues their
/// welcome message.
pub async fn register_member(
    members: &dyn MemberStore,
    messages: &dyn MessageStore,
    group_id: Uuid,
    mut new_member: NewMember,
) -> AppResult<Member> {
    let Some(group) = members.get_group(group_id).await? else {
        return Err(AppError::not_found(format!("group {group_id}")));
    };

    new_member.name = new_member.name.trim().to_owned();
    if new_member.name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    if proximity::parse_birthday(&new_member.birthday).is_none() {
        return Err(AppError::bad_request(format!(
            "birthday {:?} is not YYYY-MM-DD",
            new_member.birthday
        )));
    }
    new_member.contact_number = new_member
        .contact_number
        .map(|number| number.trim().to_owned())
        .filter(|number| !number.is_empty());

    let member = members.insert_member(group.id, new_member).await?;
    info!(member_id = %member.id, group_id = %group.id, "added {} to {}", member.name, group.name);

    if let Some(contact_number) = member.contact_number.clone() {
        messages
            .enqueue_message(NewMessage {
                group_id: group.id,
                member_id: member.id,
                recipient_number: contact_number,
                template_name: WELCOME.to_owned(),
                template_parameters: vec![member.name.clone(), group.name],
                dedupe_key: Some(format!("{WELCOME}:{}", member.id)),
            })
            .await?;
    }

    Ok(member)
}

#[debug_handler(state = AppState)]
pub(crate) async fn add_member(
    Path(group_id): Path<Uuid>,
    State(members): State<Arc<dyn MemberStore>>,
    State(messages): State<Arc<dyn MessageStore>>,
    Json(new_member): Json<NewMember>,
) -> AppResult<(StatusCode, Json<Member>)> {
    let member = register_member(members.as_ref(), messages.as_ref(), group_id, new_member).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JoinResponse {
    member: Member,
    claim_ticket: ClaimTicket,
}

/// Joining without an account. The member stays unowned until the session's
/// claim ticket is redeemed.
#[debug_handler(state = AppState)]
pub(crate) async fn join(
    Path(group_id): Path<Uuid>,
    State(members): State<Arc<dyn MemberStore>>,
    State(messages): State<Arc<dyn MessageStore>>,
    State(policy): State<Policy>,
    session: Session,
    Json(mut new_member): Json<NewMember>,
) -> AppResult<(StatusCode, Json<JoinResponse>)> {
    new_member.user_id = None;
    let member = register_member(members.as_ref(), messages.as_ref(), group_id, new_member).await?;

    let claim_ticket = ClaimTicket::issue(group_id, member.id, policy.claim_ttl, OffsetDateTime::now_utc());
    remember_claim(&session, claim_ticket.clone()).await?;

    Ok((StatusCode::CREATED, Json(JoinResponse { member, claim_ticket })))
}
