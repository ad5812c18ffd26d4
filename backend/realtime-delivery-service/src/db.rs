use crate::error::{AppError, AppResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{error, info};

const SCHEMA: &str = include_str!("../migrations/0001_realtime_delivery.sql");

/// Build a deadpool-postgres pool and verify one connection.
pub async fn init_pool(database_url: &str, max_size: usize, connect_timeout: Duration) -> AppResult<Pool> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("invalid DATABASE_URL: {e}")))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_size)
        .build()
        .map_err(|e| AppError::StartServer(format!("build db pool: {e}")))?;

    match tokio::time::timeout(connect_timeout, async {
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok::<(), AppError>(())
    })
    .await
    {
        Ok(Ok(())) => {
            info!(max_size, "Database pool created and verified");
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Database connection verification failed");
            Err(e)
        }
        Err(_) => {
            error!(
                timeout_secs = connect_timeout.as_secs(),
                "Database connection verification timeout"
            );
            Err(AppError::Database("connection verification timed out".into()))
        }
    }
}

/// Apply the idempotent schema script.
pub async fn run_migrations(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    info!("Database schema is up to date");
    Ok(())
}
