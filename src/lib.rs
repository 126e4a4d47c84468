pub mod appresult;
pub mod claims;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod groups;
pub mod proximity;
pub mod reminders;
pub mod res;
pub mod session;
pub mod store;
pub mod templates;
pub mod transport;

use std::sync::Arc;

use axum::{
    extract::FromRef,
    http::{header, HeaderName, Method},
    routing::get,
    Router,
};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};
pub use config::{Config, Policy};

use dispatch::MessageDispatcher;
use store::{MemberStore, MessageStore};
use templates::TemplateRegistry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub members: Arc<dyn MemberStore>,
    pub messages: Arc<dyn MessageStore>,
    pub templates: Arc<TemplateRegistry>,
    pub dispatcher: MessageDispatcher,
    pub policy: Policy,
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> anyhow::Result<String>;
    fn get_obj_field(&self, field: &str) -> anyhow::Result<&Value>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> anyhow::Result<String> {
        Ok(
            self.get(field)
            .ok_or_else(|| anyhow::anyhow!("expected {field} in {self}"))?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("expected {field} in {self} to be string"))?
            .to_owned()
        )
    }

    fn get_obj_field(&self, field: &str) -> anyhow::Result<&Value> {
        self.get(field)
        .ok_or_else(|| anyhow::anyhow!("expected {field} in {self}"))
    }
}

/// The full HTTP surface with sessions and CORS applied.
pub fn app(app_state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(app_state.policy.session_inactivity));

    // browsers talk to us straight from the web app
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("apikey"),
            HeaderName::from_static("x-client-info"),
        ]);

    Router::new()
        .route("/health", get(health))

        .merge(dispatch::router())
        .merge(reminders::router())
        .merge(claims::router())
        .merge(groups::router())

        .with_state(app_state)
        .layer(session_layer)
        .layer(cors)
}

async fn health() -> &'static str {
    "ok"
}
