mod dispatcher;
mod handler;

use axum::{routing::post, Router};

use crate::AppState;

pub use dispatcher::{DispatchError, DispatchResult, DispatchStatus, MessageDispatcher};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dispatch", post(handler::dispatch))
}
