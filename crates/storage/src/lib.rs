use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
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

use shared::domain::{ChannelId, SequencePosition, UserId};

mod memory;

pub use memory::MemoryStore;

/// Durable mapping of update stream to its last acknowledged position.
///
/// Writers go through [`StateStore::compare_and_set`] only, so a position can
/// never move unless the caller saw the value it replaces.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, channel_id: ChannelId) -> Result<Option<SequencePosition>>;

    /// Replaces the stored position when its pts equals `expected`
    /// (`None` meaning "nothing stored yet"). Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        channel_id: ChannelId,
        expected: Option<i64>,
        new: SequencePosition,
    ) -> Result<bool>;

    async fn positions(&self) -> Result<Vec<SequencePosition>>;

    async fn forget(&self, channel_id: ChannelId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub user_id: UserId,
    pub is_bot: bool,
    pub username: Option<String>,
    pub access_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self) -> Result<Option<StoredSession>>;
    async fn save_session(&self, session: &StoredSession) -> Result<()>;
    async fn clear_session(&self) -> Result<()>;
}

fn ensure_channel_matches(channel_id: ChannelId, new: &SequencePosition) -> Result<()> {
    if new.channel_id != channel_id {
        return Err(anyhow!(
            "position for channel {} cannot be stored under channel {}",
            new.channel_id,
            channel_id
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open state database '{database_url}'"))?;
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
            CREATE TABLE IF NOT EXISTS update_state (
                channel_id  INTEGER PRIMARY KEY,
                pts         INTEGER NOT NULL,
                date        TEXT NOT NULL,
                updated_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure update_state table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_session (
                slot          INTEGER PRIMARY KEY CHECK (slot = 1),
                user_id       INTEGER NOT NULL,
                is_bot        INTEGER NOT NULL,
                username      TEXT,
                access_token  TEXT,
                updated_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure auth_session table exists")?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for Storage {
    async fn get(&self, channel_id: ChannelId) -> Result<Option<SequencePosition>> {
        let row = sqlx::query("SELECT pts, date FROM update_state WHERE channel_id = ?")
            .bind(channel_id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load position for channel {channel_id}"))?;
        row.map(|row| {
            Ok(SequencePosition::new(
                channel_id,
                row.try_get::<i64, _>("pts")?,
                row.try_get::<DateTime<Utc>, _>("date")?,
            ))
        })
        .transpose()
    }

    async fn compare_and_set(
        &self,
        channel_id: ChannelId,
        expected: Option<i64>,
        new: SequencePosition,
    ) -> Result<bool> {
        ensure_channel_matches(channel_id, &new)?;

        let result = match expected {
            None => sqlx::query(
                "INSERT INTO update_state (channel_id, pts, date) VALUES (?, ?, ?)
                 ON CONFLICT(channel_id) DO NOTHING",
            )
            .bind(channel_id.0)
            .bind(new.pts)
            .bind(new.date)
            .execute(&self.pool)
            .await,
            Some(expected_pts) => sqlx::query(
                "UPDATE update_state SET pts = ?, date = ?, updated_at = CURRENT_TIMESTAMP
                 WHERE channel_id = ? AND pts = ?",
            )
            .bind(new.pts)
            .bind(new.date)
            .bind(channel_id.0)
            .bind(expected_pts)
            .execute(&self.pool)
            .await,
        }
        .with_context(|| format!("failed to store position for channel {channel_id}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn positions(&self) -> Result<Vec<SequencePosition>> {
        let rows = sqlx::query("SELECT channel_id, pts, date FROM update_state ORDER BY channel_id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list stored positions")?;
        rows.into_iter()
            .map(|row| {
                Ok(SequencePosition::new(
                    ChannelId(row.try_get::<i64, _>("channel_id")?),
                    row.try_get::<i64, _>("pts")?,
                    row.try_get::<DateTime<Utc>, _>("date")?,
                ))
            })
            .collect()
    }

    async fn forget(&self, channel_id: ChannelId) -> Result<()> {
        sqlx::query("DELETE FROM update_state WHERE channel_id = ?")
            .bind(channel_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to forget position for channel {channel_id}"))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for Storage {
    async fn load_session(&self) -> Result<Option<StoredSession>> {
        let row = sqlx::query(
            "SELECT user_id, is_bot, username, access_token, updated_at
             FROM auth_session WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load persisted session")?;
        row.map(|row| {
            Ok(StoredSession {
                user_id: UserId(row.try_get::<i64, _>("user_id")?),
                is_bot: row.try_get::<i64, _>("is_bot")? != 0,
                username: row.try_get("username")?,
                access_token: row.try_get("access_token")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })
        })
        .transpose()
    }

    async fn save_session(&self, session: &StoredSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_session (slot, user_id, is_bot, username, access_token, updated_at)
             VALUES (1, ?, ?, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                user_id = excluded.user_id,
                is_bot = excluded.is_bot,
                username = excluded.username,
                access_token = excluded.access_token,
                updated_at = excluded.updated_at",
        )
        .bind(session.user_id.0)
        .bind(i64::from(session.is_bot))
        .bind(session.username.as_deref())
        .bind(session.access_token.as_deref())
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to persist session")?;
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM auth_session WHERE slot = 1")
            .execute(&self.pool)
            .await
            .context("failed to clear persisted session")?;
        Ok(())
    }
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
