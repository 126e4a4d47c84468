use axum::{body::Bytes, debug_handler, extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, AppResult};

use super::{DispatchResult, MessageDispatcher};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DispatchRequest {
    message_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DispatchResponse {
    success: bool,
    results: Vec<DispatchResult>,
}

/// `{}` or an empty body sweeps the whole queue, `{ "messageId": .. }` sends
/// just that one.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn dispatch(
    State(dispatcher): State<MessageDispatcher>,
    body: Bytes,
) -> AppResult<Json<DispatchResponse>> {
    let DispatchRequest { message_id } = if body.iter().all(u8::is_ascii_whitespace) {
        DispatchRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(AppError::bad_request)?
    };

    let results = match message_id {
        Some(message_id) => {
            let result = dispatcher
                .dispatch_one(message_id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("message {message_id}")))?;
            vec![result]
        }
        None => dispatcher.sweep().await?,
    };

    Ok(Json(DispatchResponse { success: true, results }))
}
