//! Database access for crmgate-sync
//!
//! All state lives in one SQLite database: user records, the settings bag,
//! content access rules, and the batch queue.

pub mod queue;
pub mod rules;
pub mod settings;
pub mod users;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create crmgate tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // contact_id: NULL = never looked up, '' = confirmed absent remotely.
    // tags: NULL = never fetched, '[]' = confirmed empty.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT,
            role TEXT NOT NULL DEFAULT 'subscriber',
            password_hash TEXT,
            contact_id TEXT,
            tags TEXT,
            meta TEXT NOT NULL DEFAULT '{}',
            synced_meta TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS access_rules (
            scope TEXT NOT NULL,
            scope_id INTEGER NOT NULL,
            lock_content INTEGER NOT NULL DEFAULT 0,
            allow_tags TEXT NOT NULL DEFAULT '[]',
            allow_tags_all TEXT NOT NULL DEFAULT '[]',
            allow_tags_not TEXT NOT NULL DEFAULT '[]',
            apply_tags TEXT NOT NULL DEFAULT '[]',
            remove_tags TEXT NOT NULL DEFAULT '[]',
            redirect INTEGER,
            redirect_url TEXT,
            message TEXT,
            PRIMARY KEY (scope, scope_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_terms (
            content_id INTEGER NOT NULL,
            term_id INTEGER NOT NULL,
            PRIMARY KEY (content_id, term_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // One connection only: each new connection to :memory: would see its
    // own empty database
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_tables(&pool).await.expect("Failed to init tables");
    pool
}
