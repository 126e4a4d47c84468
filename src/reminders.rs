use std::sync::Arc;

use axum::{body::Bytes, debug_handler, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::info;

use crate::{
    db::{Member, NewMessage},
    proximity::{self, Proximity},
    store::{MemberStore, MessageStore},
    templates::{BIRTHDAY_ALERT, BIRTHDAY_ALERT_ARG},
    AppError, AppResult, AppState, Policy,
};

/// Numbers in Argentina get the localized template.
fn alert_template_for(recipient_number: &str) -> &'static str {
    if recipient_number.starts_with("+54") {
        BIRTHDAY_ALERT_ARG
    } else {
        BIRTHDAY_ALERT
    }
}

fn should_alert(proximity: &Proximity, lead_days: i64) -> bool {
    proximity.is_today || (lead_days > 0 && proximity.days_until == lead_days)
}

/// Queues a `birthday_alert` for every other member of the celebrant's group
/// who has a contact number. Keyed per run date, so running it again on the
/// same day queues nothing new. Returns how many messages were queued.
pub async fn enqueue_birthday_alerts(
    members: &dyn MemberStore,
    messages: &dyn MessageStore,
    today: Date,
    lead_days: i64,
) -> anyhow::Result<usize> {
    let mut enqueued = 0;

    for group in members.list_groups().await? {
        let group_members = members.list_members(group.id).await?;

        for celebrant in &group_members {
            let Some(proximity) = proximity::proximity(&celebrant.birthday, today) else {
                continue;
            };
            if !should_alert(&proximity, lead_days) {
                continue;
            }

            for recipient in recipients(&group_members, celebrant) {
                let Some(recipient_number) = recipient.contact_number.clone() else {
                    continue;
                };
                let template_name = alert_template_for(&recipient_number);

                let queued = messages
                    .enqueue_message(NewMessage {
                        group_id: group.id,
                        member_id: recipient.id,
                        template_name: template_name.to_owned(),
                        template_parameters: vec![
                            celebrant.name.clone(),
                            celebrant.gift_wishes.clone().unwrap_or_else(|| "-".to_owned()),
                        ],
                        dedupe_key: Some(format!(
                            "{template_name}:{}:{}:{today}",
                            celebrant.id, recipient.id
                        )),
                        recipient_number,
                    })
                    .await?;

                if queued.is_some() {
                    enqueued += 1;
                }
            }
        }
    }

    info!(%today, enqueued, "queued birthday alerts");
    Ok(enqueued)
}

fn recipients<'a>(group_members: &'a [Member], celebrant: &'a Member) -> impl Iterator<Item = &'a Member> {
    group_members.iter().filter(move |member| member.id != celebrant.id)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RunRequest {
    date: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RunResponse {
    success: bool,
    date: String,
    enqueued: usize,
}

#[debug_handler(state = AppState)]
pub(crate) async fn run(
    State(members): State<Arc<dyn MemberStore>>,
    State(messages): State<Arc<dyn MessageStore>>,
    State(policy): State<Policy>,
    body: Bytes,
) -> AppResult<Json<RunResponse>> {
    let RunRequest { date } = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(AppError::bad_request)?
    };

    let today = match date {
        Some(raw) => proximity::parse_date(&raw)
            .ok_or_else(|| AppError::bad_request(format!("date {raw:?} is not YYYY-MM-DD")))?,
        None => policy.today(),
    };

    let enqueued = enqueue_birthday_alerts(
        members.as_ref(),
        messages.as_ref(),
        today,
        policy.reminder_lead_days,
    )
    .await?;

    Ok(Json(RunResponse { success: true, date: today.to_string(), enqueued }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reminders/run", post(run))
}
