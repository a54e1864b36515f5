use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::Result,
    models::session::{Session, SessionState},
    repositories::column,
};

/// Row storage for sessions. Rows are kept after they end; only their state changes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts `session` and, in the same atomic step, revokes the oldest active
    /// sessions of the subject so at most `max_active` stay active.
    ///
    /// Returns the evicted sessions.
    async fn insert_with_cap(
        &self,
        session: &Session,
        max_active: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    async fn find(&self, session_id: &str) -> Result<Option<Session>>;

    /// Moves `last_activity_at` forward, capped at `expires_at`. Only applies to
    /// active sessions; returns false if the session ended in the meantime.
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Ends an active session. Returns the session as it was before, or `None`
    /// if it was already inactive.
    async fn deactivate(
        &self,
        session_id: &str,
        state: SessionState,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Active sessions of a subject, most recent activity first.
    async fn list_active(&self, subject_id: Uuid) -> Result<Vec<Session>>;

    /// Active sessions that expired before `expired_before` or were last used before `idle_before`.
    async fn find_stale(
        &self,
        expired_before: DateTime<Utc>,
        idle_before: DateTime<Utc>,
    ) -> Result<Vec<Session>>;
}

fn row_to_session(row: &Row) -> Result<Session> {
    Ok(Session {
        session_id: column(row, "session_id")?,
        subject_id: column(row, "subject_id")?,
        created_at: column(row, "created_at")?,
        last_activity_at: column(row, "last_activity_at")?,
        expires_at: column(row, "expires_at")?,
        ip_address: column(row, "ip_address")?,
        user_agent: column(row, "user_agent")?,
        is_active: column(row, "is_active")?,
        state: column(row, "state")?,
        login_method: column(row, "login_method")?,
    })
}

/// Postgres-backed session storage.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: Pool,
}

impl PgSessionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_with_cap(
        &self,
        session: &Session,
        max_active: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serializes concurrent logins of the same subject.
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
            &[&session.subject_id.to_string()],
        )
        .await?;

        let active = tx
            .query(
                r#"
                SELECT *
                FROM user_sessions
                WHERE subject_id = $1 AND is_active
                ORDER BY last_activity_at ASC
                "#,
                &[&session.subject_id],
            )
            .await?;

        let overflow = (active.len() + 1).saturating_sub(max_active);
        let mut evicted = Vec::with_capacity(overflow);
        for row in active.iter().take(overflow) {
            let victim = row_to_session(row)?;
            tx.execute(
                r#"
                UPDATE user_sessions
                SET is_active = FALSE, state = $2, ended_at = $3
                WHERE session_id = $1
                "#,
                &[&victim.session_id, &SessionState::Revoked, &now],
            )
            .await?;
            evicted.push(victim);
        }

        tx.execute(
            r#"
            INSERT INTO user_sessions (
                session_id, subject_id, created_at, last_activity_at, expires_at,
                ip_address, user_agent, is_active, state, login_method
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            &[
                &session.session_id,
                &session.subject_id,
                &session.created_at,
                &session.last_activity_at,
                &session.expires_at,
                &session.ip_address,
                &session.user_agent,
                &session.is_active,
                &session.state,
                &session.login_method,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(evicted)
    }

    async fn find(&self, session_id: &str) -> Result<Option<Session>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM user_sessions WHERE session_id = $1",
                &[&session_id],
            )
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE user_sessions
                SET last_activity_at = LEAST($2, expires_at)
                WHERE session_id = $1 AND is_active
                "#,
                &[&session_id, &at],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn deactivate(
        &self,
        session_id: &str,
        state: SessionState,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let client = self.pool.get().await?;
        // The sub-select returns the row as it was before the update.
        let row = client
            .query_opt(
                r#"
                UPDATE user_sessions AS s
                SET is_active = FALSE, state = $2, ended_at = $3
                FROM (SELECT * FROM user_sessions WHERE session_id = $1 FOR UPDATE) AS before
                WHERE s.session_id = before.session_id AND before.is_active
                RETURNING before.*
                "#,
                &[&session_id, &state, &now],
            )
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_active(&self, subject_id: Uuid) -> Result<Vec<Session>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM user_sessions
                WHERE subject_id = $1 AND is_active
                ORDER BY last_activity_at DESC
                "#,
                &[&subject_id],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn find_stale(
        &self,
        expired_before: DateTime<Utc>,
        idle_before: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM user_sessions
                WHERE is_active AND (expires_at < $1 OR last_activity_at < $2)
                "#,
                &[&expired_before, &idle_before],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }
}
