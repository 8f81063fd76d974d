use crate::config::AppConfig;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::time::Duration;
use tracing::info;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool using pool settings from the application config.
pub async fn connect(config: &AppConfig) -> Result<DbPool, DbErr> {
    let mut options = ConnectOptions::new(config.database_url.clone());
    options
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .connect_timeout(Duration::from_secs(config.db_connect_timeout_secs))
        .sqlx_logging(false);

    let pool = Database::connect(options).await?;
    info!(
        max_connections = config.db_max_connections,
        "database connection established"
    );
    Ok(pool)
}
