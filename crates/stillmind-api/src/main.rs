mod auth;
mod config;
mod error;
mod mailer;
mod rate_limit;
mod routes;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use config::AppConfig;
use mailer::LogMailer;
use routes::{app_router, AppState};
use store::EntryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stillmind_api=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting stillmind-api with config: {:?}", config);

    let store = Arc::new(EntryStore::open(&config.database_path).await?);
    let bind_addr = config.bind_addr.clone();
    let router = app_router(AppState::new(config, store, Arc::new(LogMailer)));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("stillmind-api listening on {}", bind_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
