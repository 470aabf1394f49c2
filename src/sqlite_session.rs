//! SQLite-backed session storage.
//!
//! [`SqliteSession`] persists conversation items in a SQLite database via
//! `sqlx`, keeping history across process restarts. Items are ordered by a
//! per-session sequence number. `new_in_memory` backs the session with an
//! in-memory database for tests.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;

use crate::error::Result;
use crate::items::RunItem;
use crate::memory::Session;

pub struct SqliteSession {
    session_id: String,
    pool: Pool<Sqlite>,
}

impl SqliteSession {
    /// Open (creating if missing) the database at `db_path` and bind to the
    /// given session id.
    pub async fn new(session_id: impl Into<String>, db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::run_migrations(&pool).await?;

        Ok(Self {
            session_id: session_id.into(),
            pool,
        })
    }

    /// In-memory variant for tests; data is lost when the pool closes.
    pub async fn new_in_memory(session_id: impl Into<String>) -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::run_migrations(&pool).await?;

        Ok(Self {
            session_id: session_id.into(),
            pool,
        })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                item_type TEXT NOT NULL,
                item_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sequence_num INTEGER NOT NULL,
                UNIQUE(session_id, sequence_num)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_session_items
            ON session_items(session_id, sequence_num)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn item_type(item: &RunItem) -> &'static str {
        match item {
            RunItem::Message(_) => "message",
            RunItem::ToolCall(_) => "tool_call",
            RunItem::ToolOutput(_) => "tool_output",
            RunItem::Handoff(_) => "handoff",
        }
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<RunItem>> {
        let query = if let Some(limit) = limit {
            sqlx::query(
                r#"
                SELECT item_data FROM session_items
                WHERE session_id = ?
                ORDER BY sequence_num DESC
                LIMIT ?
                "#,
            )
            .bind(&self.session_id)
            .bind(limit as i64)
        } else {
            sqlx::query(
                r#"
                SELECT item_data FROM session_items
                WHERE session_id = ?
                ORDER BY sequence_num ASC
                "#,
            )
            .bind(&self.session_id)
        };

        let rows = query.fetch_all(&self.pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("item_data");
            items.push(serde_json::from_str(&data)?);
        }
        // limited queries select newest-first; restore chronological order
        if limit.is_some() {
            items.reverse();
        }
        Ok(items)
    }

    async fn add_items(&self, items: Vec<RunItem>) -> Result<()> {
        let max_seq: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_num) FROM session_items WHERE session_id = ?",
        )
        .bind(&self.session_id)
        .fetch_one(&self.pool)
        .await?;

        let mut sequence_num = max_seq.unwrap_or(0) + 1;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO session_items (session_id, item_type, item_data, created_at, sequence_num)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.session_id)
            .bind(Self::item_type(&item))
            .bind(serde_json::to_string(&item)?)
            .bind(Utc::now().to_rfc3339())
            .bind(sequence_num)
            .execute(&self.pool)
            .await?;
            sequence_num += 1;
        }

        Ok(())
    }

    async fn pop_item(&self) -> Result<Option<RunItem>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, item_data FROM session_items
            WHERE session_id = ?
            ORDER BY sequence_num DESC
            LIMIT 1
            "#,
        )
        .bind(&self.session_id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                let id: i64 = row.get("id");
                let data: String = row.get("item_data");

                sqlx::query("DELETE FROM session_items WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM session_items WHERE session_id = ?")
            .bind(&self.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("session_id", &self.session_id)
            .finish()
    }
}
