//! Postgres-backed chat store.

use crate::models::{Message, Session, SessionSummary};
use crate::services::metrics;
use crate::services::store::{AppendOutcome, ChatStore};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, content, fingerprint, images, images_used, user_input, created_at";

fn db_error(operation: &str, e: sqlx::Error) -> AppError {
    metrics::record_db_error(operation);
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e))
}

fn observe(operation: &str, started: Instant) {
    metrics::record_db_operation(operation, started.elapsed().as_secs_f64());
}

fn session_not_found(id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Session {} not found", id))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "chat-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Lock the session row for the rest of the transaction. Writers on the
    /// same session queue here.
    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
        operation: &str,
    ) -> Result<(), AppError> {
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM chat_sessions WHERE id = $1 FOR UPDATE")
                .bind(session_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| db_error(operation, e))?;

        locked.map(|_| ()).ok_or_else(|| session_not_found(session_id))
    }

    async fn insert_message(
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<Message, sqlx::Error> {
        let stored = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO chat_messages
                (id, session_id, role, content, fingerprint, images, images_used, user_input)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(message.id)
        .bind(message.session_id)
        .bind(message.role.as_str())
        .bind(message.content())
        .bind(message.fingerprint())
        .bind(&message.images)
        .bind(message.images_used)
        .bind(&message.user_input)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
            .bind(message.session_id)
            .execute(&mut **tx)
            .await?;

        Ok(stored)
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn create_session(&self, session: &Session) -> Result<Session, AppError> {
        let started = Instant::now();
        let created = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO chat_sessions (id, name, model_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, model_id, created_at, updated_at
            "#,
        )
        .bind(session.id)
        .bind(&session.name)
        .bind(&session.model_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Session {} already exists", session.id))
            }
            _ => db_error("create_session", e),
        })?;
        observe("create_session", started);

        info!(model_id = %created.model_id, "Session created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, AppError> {
        let started = Instant::now();
        let sessions = sqlx::query_as::<_, SessionSummary>(
            r#"
            SELECT s.id, s.name, s.model_id, s.created_at, s.updated_at,
                   COUNT(m.id) AS message_count
            FROM chat_sessions s
            LEFT JOIN chat_messages m ON m.session_id = s.id
            GROUP BY s.id
            ORDER BY s.updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list_sessions", e))?;
        observe("list_sessions", started);

        Ok(sessions)
    }

    #[instrument(skip(self))]
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        let started = Instant::now();
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, name, model_id, created_at, updated_at FROM chat_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get_session", e))?;
        observe("get_session", started);

        Ok(session)
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, id: Uuid) -> Result<bool, AppError> {
        let started = Instant::now();
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_session", e))?;
        observe("delete_session", started);

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!("Session deleted");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, AppError> {
        let started = Instant::now();
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = $1 ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list_messages", e))?;
        observe("list_messages", started);

        Ok(messages)
    }

    #[instrument(skip(self))]
    async fn recent_messages(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let started = Instant::now();
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = $1 ORDER BY seq DESC LIMIT $2",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("recent_messages", e))?;
        observe("recent_messages", started);

        Ok(messages)
    }

    #[instrument(skip(self))]
    async fn find_message(&self, id: Uuid) -> Result<Option<Message>, AppError> {
        let started = Instant::now();
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM chat_messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find_message", e))?;
        observe("find_message", started);

        Ok(message)
    }

    #[instrument(
        skip(self, message),
        fields(session_id = %message.session_id, message_id = %message.id, role = %message.role)
    )]
    async fn append_message(&self, message: &Message) -> Result<Message, AppError> {
        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("append_message", e))?;

        Self::lock_session(&mut tx, message.session_id, "append_message").await?;
        let stored = Self::insert_message(&mut tx, message)
            .await
            .map_err(|e| db_error("append_message", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("append_message", e))?;
        observe("append_message", started);

        Ok(stored)
    }

    #[instrument(
        skip(self, message),
        fields(session_id = %message.session_id, message_id = %message.id)
    )]
    async fn append_unless_duplicate(
        &self,
        message: &Message,
        window: Duration,
    ) -> Result<AppendOutcome, AppError> {
        const OP: &str = "append_unless_duplicate";
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_error(OP, e))?;

        Self::lock_session(&mut tx, message.session_id, OP).await?;

        let by_id: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM chat_messages WHERE id = $1")
            .bind(message.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error(OP, e))?;
        if let Some((id,)) = by_id {
            tx.rollback().await.map_err(|e| db_error(OP, e))?;
            return Ok(AppendOutcome::Duplicate(id));
        }

        let recent: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM chat_messages
            WHERE session_id = $1
              AND role = $2
              AND fingerprint = $3
              AND created_at >= NOW() - make_interval(secs => $4)
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(message.session_id)
        .bind(message.role.as_str())
        .bind(message.fingerprint())
        .bind(window.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error(OP, e))?;
        if let Some((id,)) = recent {
            tx.rollback().await.map_err(|e| db_error(OP, e))?;
            return Ok(AppendOutcome::Duplicate(id));
        }

        let stored = match Self::insert_message(&mut tx, message).await {
            Ok(stored) => stored,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                warn!("Concurrent insert with the same message id; treating as duplicate");
                return Ok(AppendOutcome::Duplicate(message.id));
            }
            Err(e) => return Err(db_error(OP, e)),
        };

        tx.commit().await.map_err(|e| db_error(OP, e))?;
        observe(OP, started);

        Ok(AppendOutcome::Inserted(stored))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}
