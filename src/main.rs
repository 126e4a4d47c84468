use std::sync::Arc;

use birthdaybuddy::{
    app, dispatch::MessageDispatcher, res, store::SqliteStore, templates::TemplateRegistry,
    transport::WhatsAppTransport, AppState, Config, Policy,
};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,birthdaybuddy=debug")))
        .init();

    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    res::apply_schema(&db_pool).await?;

    let store = Arc::new(SqliteStore::new(db_pool));
    let templates = Arc::new(TemplateRegistry::builtin()?);
    let transport = Arc::new(WhatsAppTransport::from_config(&config)?);

    let app_state = AppState {
        members: store.clone(),
        messages: store.clone(),
        templates: templates.clone(),
        dispatcher: MessageDispatcher::new(store, transport, templates, config.transport_timeout)
            .with_stale_claim_after(config.stale_claim_after),
        policy: Policy::from(&config),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("listening on {}", config.bind_address);

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
