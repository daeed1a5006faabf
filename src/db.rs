//! Database module - SQLite connection and migrations

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Create database connection pool
pub async fn create_pool(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
}

/// In-memory pool for tests. A single connection keeps the database alive
/// and shared across all queries.
pub async fn create_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the schema, additive column migrations, and secondary indices.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    // Columns added after the first release. ALTER fails with "duplicate
    // column name" on an up-to-date schema, which is the expected no-op.
    for alter in ADDITIVE_COLUMNS {
        if let Err(err) = sqlx::query(alter).execute(pool).await {
            if !err.to_string().contains("duplicate column name") {
                return Err(err);
            }
        }
    }

    for index in INDEX_SQL {
        sqlx::query(index).execute(pool).await?;
    }

    tracing::info!("database schema applied");
    Ok(())
}

/// Base schema. Append-only: rows are never updated or deleted.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    observed_at TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    source_address TEXT NOT NULL,
    geo_country TEXT,
    geo_region TEXT,
    geo_city TEXT,
    geo_latitude REAL,
    geo_longitude REAL,
    geo_isp TEXT,
    geo_org TEXT,
    geo_timezone TEXT,
    geo_is_private INTEGER NOT NULL DEFAULT 0,
    protocol TEXT NOT NULL DEFAULT 'HTTP',
    target_service TEXT NOT NULL,
    action TEXT NOT NULL,
    target_path TEXT,
    session_id TEXT NOT NULL,
    user_agent TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    payload TEXT NOT NULL DEFAULT '{}',
    score REAL NOT NULL DEFAULT 0,
    band TEXT NOT NULL DEFAULT 'MINIMAL',
    is_anomaly INTEGER NOT NULL DEFAULT 0,
    predicted_class TEXT NOT NULL DEFAULT 'BENIGN',
    content_hash TEXT NOT NULL UNIQUE
)
"#;

/// Additive migrations for databases created before these fields existed.
const ADDITIVE_COLUMNS: &[&str] = &[
    "ALTER TABLE events ADD COLUMN traffic_class TEXT",
    "ALTER TABLE events ADD COLUMN anomaly_component REAL",
    "ALTER TABLE events ADD COLUMN scoring_degraded INTEGER NOT NULL DEFAULT 0",
];

const INDEX_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_events_ingested_at ON events(ingested_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_source_address ON events(source_address)",
    "CREATE INDEX IF NOT EXISTS idx_events_action ON events(action)",
    "CREATE INDEX IF NOT EXISTS idx_events_target_service ON events(target_service)",
    "CREATE INDEX IF NOT EXISTS idx_events_band ON events(band)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = create_memory_pool().await.unwrap();
        // Second run exercises the duplicate-column path.
        run_migrations(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn additive_columns_exist_after_migration() {
        let pool = create_memory_pool().await.unwrap();
        // Fails if the migrated columns are missing.
        sqlx::query("SELECT traffic_class, anomaly_component, scoring_degraded FROM events")
            .fetch_all(&pool)
            .await
            .unwrap();
    }
}
