use std::sync::Arc;

use axum::{debug_handler, extract::{Path, Query, State}, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    proximity::{self, UpcomingBirthday},
    store::MemberStore,
    AppError, AppResult, AppState, Policy,
};

#[derive(Debug, Deserialize)]
pub(crate) struct UpcomingQuery {
    threshold: Option<i64>,
    /// the viewer's local date, defaults to the server's reminder date
    date: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpcomingResponse {
    group_id: Uuid,
    today: String,
    upcoming: Vec<UpcomingBirthday>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn upcoming(
    Path(group_id): Path<Uuid>,
    Query(UpcomingQuery { threshold, date }): Query<UpcomingQuery>,
    State(members): State<Arc<dyn MemberStore>>,
    State(policy): State<Policy>,
) -> AppResult<Json<UpcomingResponse>> {
    if members.get_group(group_id).await?.is_none() {
        return Err(AppError::not_found(format!("group {group_id}")));
    }

    let today = match date {
        Some(raw) => proximity::parse_date(&raw)
            .ok_or_else(|| AppError::bad_request(format!("date {raw:?} is not YYYY-MM-DD")))?,
        None => policy.today(),
    };
    let threshold = threshold.unwrap_or(policy.upcoming_threshold_days);

    let group_members = members.list_members(group_id).await?;

    Ok(Json(UpcomingResponse {
        group_id,
        today: today.to_string(),
        upcoming: proximity::upcoming(&group_members, today, threshold),
    }))
}
