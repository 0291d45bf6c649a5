use axum::http::{header, HeaderValue, Method};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use chat_subscriptions::{
    config::StorageBackend,
    database,
    engine::{Clock, SubscriptionEngine, SystemClock},
    handlers,
    join_client::HttpJoinClient,
    middleware::ApiAuth,
    services::ChatGroupService,
    store::{GroupStore, MemoryStore, PgStore, TaskStore},
    AppState, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chat_subscriptions=info,sqlx=warn,info"));
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(filter)
        .init();

    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;

    let (tasks, groups): (Arc<dyn TaskStore>, Arc<dyn GroupStore>) = match settings.storage {
        StorageBackend::Postgres => {
            let database_url = settings.database_url.as_deref().unwrap_or_default();
            let pool = database::create_pool(database_url).await?;

            if settings.skip_migrations {
                warn!("Skipping migrations due to SKIP_MIGRATIONS=true");
            } else {
                database::run_migrations(&pool).await?;
            }

            let store = Arc::new(PgStore::new(pool));
            (store.clone() as Arc<dyn TaskStore>, store as Arc<dyn GroupStore>)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; tasks will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn TaskStore>, store as Arc<dyn GroupStore>)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let join_client = HttpJoinClient::new(
        settings.join_gateway_url.clone(),
        settings.join_gateway_token.clone(),
        settings.join_timeout,
    )?;

    let engine = SubscriptionEngine::new(
        tasks,
        groups.clone(),
        Arc::new(join_client),
        clock.clone(),
        settings.pacing.clone(),
    );

    let recovered = engine.recover_interrupted().await?;
    if recovered > 0 {
        info!("Recovered {} interrupted subscription tasks", recovered);
    }

    let resumer = if settings.auto_resume_flood_wait {
        info!(
            every_secs = settings.auto_resume_poll.as_secs(),
            "Automatic flood-wait resume enabled"
        );
        Some(engine.spawn_flood_wait_resumer(settings.auto_resume_poll))
    } else {
        None
    };

    let state = AppState {
        engine: engine.clone(),
        groups: Arc::new(ChatGroupService::new(groups, clock)),
        auth: Arc::new(ApiAuth::new(
            settings.api_tokens.clone(),
            settings.api_rate_per_second,
        )),
    };

    let app = handlers::router(state).layer(cors_layer(&settings));

    let listener = tokio::net::TcpListener::bind(settings.bind_address()).await?;
    info!("Server starting on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    if let Some(resumer) = resumer {
        resumer.await.ok();
    }
    info!("Server stopped");

    Ok(())
}

// Permissive in development, explicit origin list otherwise
fn cors_layer(settings: &Settings) -> CorsLayer {
    let cors = if settings.debug_mode {
        info!("Development mode: using permissive CORS");
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = settings
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Ignoring unparseable origin '{}': {}", origin, e);
                    None
                }
            })
            .collect();
        info!("CORS configured for {} origins", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_credentials(true)
    };

    cors.allow_methods([
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ])
    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
