mod members;
mod upcoming;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use members::register_member;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/groups", post(members::new_group))
        .route("/groups/{group_id}/members", get(members::list).post(members::add_member))
        .route("/groups/{group_id}/join", post(members::join))
        .route("/groups/{group_id}/upcoming", get(upcoming::upcoming))
}
