use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::ConversationId;

const ACTIVE_CONVERSATION_KEY: &str = "active_conversation_id";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `sqlite::memory:` is a separate database.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_tokens (
                slot          INTEGER PRIMARY KEY CHECK (slot = 1),
                access_token  TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure session_tokens table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure client_state table exists")?;

        Ok(())
    }

    pub async fn save_token_pair(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_tokens (slot, access_token, refresh_token, updated_at)
             VALUES (1, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to persist token pair")?;
        debug!("storage: token pair persisted");
        Ok(())
    }

    pub async fn load_token_pair(&self) -> Result<Option<StoredTokenPair>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, updated_at FROM session_tokens WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load token pair")?;

        row.map(|row| -> Result<StoredTokenPair> {
            Ok(StoredTokenPair {
                access_token: row.try_get("access_token")?,
                refresh_token: row.try_get("refresh_token")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn clear_token_pair(&self) -> Result<()> {
        sqlx::query("DELETE FROM session_tokens")
            .execute(&self.pool)
            .await
            .context("failed to clear token pair")?;
        Ok(())
    }

    pub async fn save_active_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        sqlx::query(
            "INSERT INTO client_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(ACTIVE_CONVERSATION_KEY)
        .bind(conversation_id.0.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to persist active conversation")?;
        Ok(())
    }

    /// Returns `None` when nothing is stored or the stored value is not a
    /// conversation id.
    pub async fn load_active_conversation(&self) -> Result<Option<ConversationId>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM client_state WHERE key = ?")
                .bind(ACTIVE_CONVERSATION_KEY)
                .fetch_optional(&self.pool)
                .await
                .context("failed to load active conversation")?;
        Ok(value
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(ConversationId))
    }

    pub async fn clear_active_conversation(&self) -> Result<()> {
        sqlx::query("DELETE FROM client_state WHERE key = ?")
            .bind(ACTIVE_CONVERSATION_KEY)
            .execute(&self.pool)
            .await
            .context("failed to clear active conversation")?;
        Ok(())
    }

    /// Drops everything tied to the signed-in session.
    pub async fn clear_session(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session_tokens")
            .execute(&mut *tx)
            .await
            .context("failed to clear token pair")?;
        sqlx::query("DELETE FROM client_state WHERE key = ?")
            .bind(ACTIVE_CONVERSATION_KEY)
            .execute(&mut *tx)
            .await
            .context("failed to clear active conversation")?;
        tx.commit().await?;
        Ok(())
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
