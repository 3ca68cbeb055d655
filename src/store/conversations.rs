//! Conversation repository: append-only turn logs per session.
//!
//! History is a flat text log of alternating `User:` / `Assistant:` lines.
//! Appends are serialized by a per-session mutex; reads go straight to the
//! pool. When a history grows past `max_conversation_length` characters the
//! oldest complete turns are dropped, never splitting a turn.
//!
//! Source attributions for assistant turns are stored per session as a JSON
//! list of lists, one inner list per assistant turn, in order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::{HarnessError, Result};
use crate::models::{SessionSummary, Source};

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
    max_length: usize,
    /// One write lock per session; the outer mutex only guards the map.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool, max_length: usize) -> Self {
        Self {
            pool,
            max_length,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Full history text; empty string when the session does not exist.
    pub async fn get_history(&self, session_id: &str) -> Result<String> {
        let history: Option<String> =
            sqlx::query_scalar("SELECT history FROM conversations WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(history.unwrap_or_default())
    }

    /// Append one user/assistant turn, truncating oldest turns when the
    /// history exceeds the cap.
    pub async fn append(&self, session_id: &str, user: &str, assistant: &str) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(HarnessError::validation("session id must not be empty"));
        }

        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let existing = self.get_history(session_id).await?;
        let turn = format!("User: {user}\nAssistant: {assistant}");
        let mut history = if existing.is_empty() {
            turn
        } else {
            format!("{existing}\n{turn}")
        };

        if history.chars().count() > self.max_length {
            history = truncate_oldest_turns(&history, self.max_length);
        }

        self.write_history(session_id, &history).await
    }

    /// Replace the entire history for a session.
    pub async fn set_history(&self, session_id: &str, history: &str) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(HarnessError::validation("session id must not be empty"));
        }
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        self.write_history(session_id, history).await
    }

    async fn write_history(&self, session_id: &str, history: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO conversations (session_id, history, created_at, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                history = excluded.history,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(session_id)
        .bind(history)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear(&self, session_id: &str) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;
        sqlx::query("DELETE FROM conversation_sources WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<u64> {
        sqlx::query("DELETE FROM conversation_sources")
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM conversations")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn all_session_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT session_id FROM conversations ORDER BY last_updated DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn get_timestamps(
        &self,
        session_id: &str,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let row = sqlx::query(
            "SELECT created_at, last_updated FROM conversations WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HarnessError::not_found(format!("session {session_id}")))?;

        let created: String = row.try_get("created_at")?;
        let updated: String = row.try_get("last_updated")?;
        Ok((parse_rfc3339(&created)?, parse_rfc3339(&updated)?))
    }

    pub async fn summaries(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            "SELECT session_id, history, created_at, last_updated FROM conversations ORDER BY last_updated DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let history: String = row.try_get("history")?;
                let created: String = row.try_get("created_at")?;
                let updated: String = row.try_get("last_updated")?;
                Ok(SessionSummary {
                    session_id: row.try_get("session_id")?,
                    created_at: parse_rfc3339(&created)?,
                    last_updated: parse_rfc3339(&updated)?,
                    turn_count: count_turns(&history),
                })
            })
            .collect()
    }

    /// Append one assistant turn's sources to the session's attribution log.
    pub async fn append_sources(&self, session_id: &str, sources: &[Source]) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT sources_json FROM conversation_sources WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut all: Vec<Vec<Source>> = match existing {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        all.push(sources.to_vec());

        sqlx::query(
            r#"
            INSERT INTO conversation_sources (session_id, sources_json)
            VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE SET sources_json = excluded.sources_json
            "#,
        )
        .bind(session_id)
        .bind(serde_json::to_string(&all)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All attribution lists for a session, one inner list per assistant turn.
    pub async fn get_sources(&self, session_id: &str) -> Result<Vec<Vec<Source>>> {
        let json: Option<String> = sqlx::query_scalar(
            "SELECT sources_json FROM conversation_sources WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarnessError::validation(format!("invalid timestamp in store: {e}")))
}

/// Number of `User:` turns in a history log.
fn count_turns(history: &str) -> usize {
    history.lines().filter(|l| l.starts_with("User: ")).count()
}

/// Drop oldest complete turns until the history fits `max_chars`.
///
/// A turn starts at a `User: ` line and runs until the next one, so
/// multi-line assistant answers are never split.
fn truncate_oldest_turns(history: &str, max_chars: usize) -> String {
    let lines: Vec<&str> = history.lines().collect();
    let turn_starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("User: "))
        .map(|(i, _)| i)
        .collect();

    for &start in &turn_starts {
        let candidate = lines[start..].join("\n");
        if candidate.chars().count() <= max_chars {
            return candidate;
        }
    }

    // Even the newest turn alone is over the cap; keep it whole.
    turn_starts
        .last()
        .map(|&start| lines[start..].join("\n"))
        .unwrap_or_else(|| history.to_string())
}
