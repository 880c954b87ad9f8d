use anyhow::{Context, Result};
use log::{debug, info};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::model::{ConfigurationDocument, Fingerprint, Revision, RevisionSummary};
use crate::store::traits::{ChangeMetadata, ConfigStore, PersistOutcome, StoreError};

const REVISION_COLUMNS: &str =
    "id, fingerprint, parent_fingerprint, author, message, created_at, data, data_size, node_count";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the revision and head tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS config_revisions (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                parent_fingerprint TEXT,
                author TEXT NOT NULL,
                message TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                data BYTEA NOT NULL,
                data_size BIGINT NOT NULL,
                node_count INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_config_revisions_fingerprint
                ON config_revisions (fingerprint, created_at DESC)",
            "CREATE TABLE IF NOT EXISTS config_head (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                fingerprint TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run configuration migrations")?;
        }
        Ok(())
    }

    /// Store `document` as the first revision unless a head already exists
    pub async fn initialize(&self, document: &ConfigurationDocument) -> Result<Fingerprint> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM config_head WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to read configuration head")?;
        if let Some(existing) = existing {
            return Ok(Fingerprint::new(existing));
        }

        let revision = Revision::initial(document).context("Failed to build initial revision")?;
        Self::insert_revision(&mut tx, &revision).await?;
        sqlx::query("INSERT INTO config_head (id, fingerprint, updated_at) VALUES (1, $1, $2)")
            .bind(revision.fingerprint.as_str())
            .bind(revision.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to create configuration head")?;
        tx.commit().await.context("Failed to commit initial revision")?;

        info!("Initialized configuration at {}", revision.fingerprint.short());
        Ok(revision.fingerprint)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_revision(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        revision: &Revision,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO config_revisions
                (id, fingerprint, parent_fingerprint, author, message, created_at, data, data_size, node_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&revision.id)
        .bind(revision.fingerprint.as_str())
        .bind(revision.parent_fingerprint.as_ref().map(|f| f.as_str()))
        .bind(&revision.author)
        .bind(&revision.message)
        .bind(revision.created_at)
        .bind(&revision.data)
        .bind(revision.data_size)
        .bind(revision.node_count)
        .execute(&mut **tx)
        .await
        .context("Failed to insert revision")?;
        Ok(())
    }

    fn revision_from_row(row: &PgRow) -> Result<Revision, sqlx::Error> {
        Ok(Revision {
            id: row.try_get("id")?,
            fingerprint: Fingerprint::new(row.try_get::<String, _>("fingerprint")?),
            parent_fingerprint: row
                .try_get::<Option<String>, _>("parent_fingerprint")?
                .map(Fingerprint::new),
            author: row.try_get("author")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
            data: row.try_get("data")?,
            data_size: row.try_get("data_size")?,
            node_count: row.try_get("node_count")?,
        })
    }
}

#[async_trait::async_trait]
impl ConfigStore for PostgresStore {
    async fn current(&self) -> Result<(ConfigurationDocument, Fingerprint), StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM config_revisions
             WHERE fingerprint = (SELECT fingerprint FROM config_head WHERE id = 1)
             ORDER BY created_at DESC LIMIT 1",
            REVISION_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch current configuration")?;

        let Some(row) = row else {
            return Err(StoreError::Unavailable(
                "configuration has not been initialized".to_string(),
            ));
        };
        let revision = Self::revision_from_row(&row)?;
        let document = revision.document().map_err(|e| StoreError::CorruptRevision {
            fingerprint: revision.fingerprint.clone(),
            reason: e.to_string(),
        })?;
        Ok((document, revision.fingerprint))
    }

    async fn persist(
        &self,
        document: &ConfigurationDocument,
        expected_base: &Fingerprint,
        metadata: ChangeMetadata,
    ) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Row lock on the head serializes concurrent persists
        let head: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM config_head WHERE id = 1 FOR UPDATE")
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to lock configuration head")?;
        let head = head.map(Fingerprint::new).ok_or_else(|| {
            StoreError::Unavailable("configuration has not been initialized".to_string())
        })?;

        if &head != expected_base {
            debug!(
                "Rejecting persist based on {}, head is {}",
                expected_base.short(),
                head.short()
            );
            return Ok(PersistOutcome::Stale { current: head });
        }

        let fingerprint = Fingerprint::of(document);
        if fingerprint == head {
            return Ok(PersistOutcome::Committed { fingerprint });
        }

        let revision = Revision::new(document, Some(head), metadata.author, metadata.message)?;
        Self::insert_revision(&mut tx, &revision).await?;
        sqlx::query("UPDATE config_head SET fingerprint = $1, updated_at = $2 WHERE id = 1")
            .bind(revision.fingerprint.as_str())
            .bind(revision.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to move configuration head")?;
        tx.commit().await.context("Failed to commit revision")?;

        debug!("Committed revision {}", fingerprint.short());
        Ok(PersistOutcome::Committed { fingerprint })
    }

    async fn revision_at(&self, fingerprint: &Fingerprint) -> Result<Option<Revision>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM config_revisions WHERE fingerprint = $1 ORDER BY created_at DESC LIMIT 1",
            REVISION_COLUMNS
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch revision")?;

        match row {
            Some(row) => Ok(Some(Self::revision_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn history(&self, limit: usize) -> Result<Vec<RevisionSummary>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM config_revisions ORDER BY created_at DESC LIMIT $1",
            REVISION_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list revisions")?;

        rows.iter()
            .map(|row| -> Result<RevisionSummary, StoreError> {
                Ok(Self::revision_from_row(row)?.summary())
            })
            .collect()
    }
}
