//! PostgreSQL implementation of TokenStore
//!
//! Production persistence: two flat tables (`current_tokens`,
//! `archived_tokens`) and a single-row version counter, all mutated inside
//! one transaction per batch. The transaction commit is the durability
//! barrier the master relies on before acknowledging clients.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use pinball_core::Token;

use super::store::*;

/// PostgreSQL implementation of TokenStore
///
/// # Example
///
/// ```ignore
/// use pinball_master::persistence::PostgresTokenStore;
///
/// let store = PostgresTokenStore::connect("postgres://localhost/pinball").await?;
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the token tables and the version counter row if absent
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS current_tokens (
                name            TEXT PRIMARY KEY,
                version         BIGINT NOT NULL,
                owner           TEXT,
                expiration_time BIGINT,
                priority        DOUBLE PRECISION NOT NULL DEFAULT 0,
                data            BYTEA NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS archived_tokens (
                name            TEXT PRIMARY KEY,
                version         BIGINT NOT NULL,
                owner           TEXT,
                expiration_time BIGINT,
                priority        DOUBLE PRECISION NOT NULL DEFAULT 0,
                data            BYTEA NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS version_counter (
                id           SMALLINT PRIMARY KEY CHECK (id = 0),
                last_version BIGINT NOT NULL
            )
            "#,
            r#"
            INSERT INTO version_counter (id, last_version)
            VALUES (0, 0)
            ON CONFLICT (id) DO NOTHING
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to ensure schema: {}", e);
                    StoreError::Database(e.to_string())
                })?;
        }
        Ok(())
    }
}

fn row_to_token(row: &PgRow) -> Result<Token, StoreError> {
    let name: String = row
        .try_get("name")
        .map_err(|e| StoreError::Database(e.to_string()))?;
    let read = |e: sqlx::Error| StoreError::Corrupt {
        name: name.clone(),
        reason: e.to_string(),
    };
    Ok(Token {
        version: Some(row.try_get::<i64, _>("version").map_err(read)?),
        owner: row.try_get("owner").map_err(read)?,
        expiration_time: row.try_get("expiration_time").map_err(read)?,
        priority: row.try_get("priority").map_err(read)?,
        data: row.try_get("data").map_err(read)?,
        name,
    })
}

const LOAD_ALL_SQL: &str =
    "SELECT name, version, owner, expiration_time, priority, data \
     FROM current_tokens ORDER BY name";

// left() comparison instead of LIKE: token names routinely contain
// underscores, which LIKE treats as wildcards.
const READ_ARCHIVE_SQL: &str =
    "SELECT name, version, owner, expiration_time, priority, data \
     FROM archived_tokens WHERE left(name, char_length($1)) = $1 ORDER BY name";

#[async_trait]
impl TokenStore for PostgresTokenStore {
    #[instrument(skip(self, batch), fields(
        updates = batch.updates.len(),
        deletes = batch.deletes.len(),
        archives = batch.archives.len(),
    ))]
    async fn persist(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let db = |e: sqlx::Error| {
            error!("Failed to persist batch: {}", e);
            StoreError::Database(e.to_string())
        };

        let mut tx = self.pool.begin().await.map_err(db)?;

        for token in &batch.updates {
            sqlx::query(
                r#"
                INSERT INTO current_tokens (name, version, owner, expiration_time, priority, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (name) DO UPDATE SET
                    version = EXCLUDED.version,
                    owner = EXCLUDED.owner,
                    expiration_time = EXCLUDED.expiration_time,
                    priority = EXCLUDED.priority,
                    data = EXCLUDED.data
                "#,
            )
            .bind(&token.name)
            .bind(token.version)
            .bind(&token.owner)
            .bind(token.expiration_time)
            .bind(token.priority)
            .bind(&token.data)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        if !batch.deletes.is_empty() {
            sqlx::query("DELETE FROM current_tokens WHERE name = ANY($1)")
                .bind(&batch.deletes)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        for token in &batch.archives {
            // No conflict clause: the archive is write-once, a duplicate
            // name rolls the whole batch back.
            sqlx::query(
                r#"
                INSERT INTO archived_tokens (name, version, owner, expiration_time, priority, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&token.name)
            .bind(token.version)
            .bind(&token.owner)
            .bind(token.expiration_time)
            .bind(token.priority)
            .bind(&token.data)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        sqlx::query("UPDATE version_counter SET last_version = $1 WHERE id = 0")
            .bind(batch.last_version)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        tx.commit().await.map_err(db)?;

        debug!(last_version = batch.last_version, "persisted batch");
        Ok(())
    }

    fn load_all(&self) -> BoxStream<'_, Result<Token, StoreError>> {
        sqlx::query(LOAD_ALL_SQL)
            .fetch(&self.pool)
            .map(|row| match row {
                Ok(row) => row_to_token(&row),
                Err(e) => Err(StoreError::Database(e.to_string())),
            })
            .boxed()
    }

    async fn last_version(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT last_version FROM version_counter WHERE id = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.try_get("last_version")
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn read_archive(&self, name_prefix: &str) -> BoxStream<'_, Result<Token, StoreError>> {
        sqlx::query(READ_ARCHIVE_SQL)
            .bind(name_prefix.to_string())
            .fetch(&self.pool)
            .map(|row| match row {
                Ok(row) => row_to_token(&row),
                Err(e) => Err(StoreError::Database(e.to_string())),
            })
            .boxed()
    }
}
