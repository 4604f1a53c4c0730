//! Data Access Layer
//!
//! All SQLite access goes through this module. Queries are runtime-checked
//! `sqlx` calls against the embedded migrations; the `Db` wrapper keeps the
//! rest of the service away from raw pool handles.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use crate::models::{Message, MessageRole, Session};

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("failed to open database")?;
        Ok(Self::new(pool))
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Creates a new active session, deactivating every other session in
    /// the same transaction so at most one row is active.
    pub async fn create_session(&self, topic: &str) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            active: true,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sessions SET active = 0 WHERE active = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO sessions (id, topic, active, created_at) VALUES (?, ?, ?, ?)")
            .bind(session.id)
            .bind(&session.topic)
            .bind(session.active)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, topic, active, created_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// The most recently created session still flagged active, if any.
    pub async fn latest_active_session(&self) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, topic, active, created_at FROM sessions \
             WHERE active = 1 ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT id, topic, active, created_at FROM sessions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    pub async fn deactivate_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks `id` as the one active session (used when resuming a prior
    /// session record).
    pub async fn activate_session(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sessions SET active = 0 WHERE active = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sessions SET active = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Appends one immutable transcript entry.
    pub async fn add_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (session_id, role, content, message_id, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, session_id, role, content, message_id, created_at",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(message)
    }

    /// Full transcript for a session in insertion order.
    pub async fn session_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, session_id, role, content, message_id, created_at \
             FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
