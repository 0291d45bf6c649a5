use sqlx::{postgres::{PgConnectOptions, PgPoolOptions}, PgPool};
use std::str::FromStr;
use tracing::{info, warn};

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?
        .application_name("chat-subscriptions")
        .statement_cache_capacity(200);

    // Few connections: each run-loop touches the database once per join
    // attempt, and attempts are minutes apart.
    PgPoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .idle_timeout(std::time::Duration::from_secs(60))
        .connect_with(options)
        .await
}

/// Apply pending migrations. A diverged migration history is reported
/// and tolerated; any other failure aborts startup.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    match sqlx::migrate!("./migrations").run(pool).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(sqlx::migrate::MigrateError::VersionMismatch(version)) => {
            warn!("Migration version mismatch: {}", version);
            warn!("Database has different migration state than expected");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("failed to run migrations: {}", e)),
    }
}
