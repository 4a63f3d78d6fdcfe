//! Postgres store.
//!
//! Connection pool, migrations, and health check, plus the work item
//! operations. Rows carry the serialized item as JSONB alongside the
//! columns the queries need; all lifecycle bookkeeping goes through the
//! pure transition engine, with row locks (`FOR UPDATE SKIP LOCKED`) and a
//! revision check supplying the at-most-once-claim guarantee.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::model::{Condition, Create, Filter, Pagination, Poll, Update, Work, WorkId};
use crate::store::Store;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_row<'e, E>(executor: E, work: &Work) -> Result<u64>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let doc = serde_json::to_value(work)
            .map_err(|e| Error::Other(format!("serialize work item: {e}")))?;
        let affected = sqlx::query(
            "UPDATE work_items SET
                 state = $2, processing_priority = $3, processing_available_time = $4,
                 processing_timeout_time = $5, failing_retry_time = $6,
                 revision = $7, doc = $8
             WHERE id = $1 AND revision = $7 - 1",
        )
        .bind(work.id.as_str())
        .bind(work.state.to_string())
        .bind(work.processing_priority)
        .bind(work.processing_available_time)
        .bind(work.processing_timeout_time)
        .bind(work.failing_retry_time)
        .bind(work.revision)
        .bind(&doc)
        .execute(executor)
        .await?
        .rows_affected();
        Ok(affected)
    }
}

fn work_from_doc(doc: serde_json::Value) -> Result<Work> {
    serde_json::from_value(doc).map_err(|e| Error::Other(format!("deserialize work item: {e}")))
}

#[async_trait]
impl Store for PostgresStore {
    async fn poll(&self, poll: &Poll) -> Result<Vec<Work>> {
        poll.validate()?;
        let now = Utc::now();
        let mut claimed = Vec::new();

        for (work_type, quantity) in poll.type_quantities.iter() {
            let mut tx = self.pool.begin().await?;

            // Lock eligible candidates; SKIP LOCKED keeps concurrent
            // pollers (other service instances included) off the same rows.
            let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
                "SELECT doc FROM work_items
                 WHERE work_type = $1
                   AND ((state = 'pending' AND processing_available_time <= $2)
                     OR (state = 'failing' AND failing_retry_time <= $2)
                     OR (state = 'processing' AND processing_timeout_time <= $2))
                 ORDER BY processing_priority DESC, processing_available_time ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(work_type)
            .bind(now)
            .bind(quantity as i64)
            .fetch_all(&mut *tx)
            .await?;

            for (doc,) in rows {
                let work = work_from_doc(doc)?;

                if let Some(ref serial) = work.serial_id {
                    // Serialize same-serial claims across transactions; the
                    // probe alone cannot see a concurrent uncommitted claim.
                    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                        .bind(serial)
                        .execute(&mut *tx)
                        .await?;
                    let (held,): (bool,) = sqlx::query_as(
                        "SELECT EXISTS(
                             SELECT 1 FROM work_items
                             WHERE serial_id = $1 AND id <> $2
                               AND state = 'processing'
                               AND processing_timeout_time > $3)",
                    )
                    .bind(serial)
                    .bind(work.id.as_str())
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                    if held {
                        continue;
                    }
                }

                let next = work.claiming(now)?;
                // The row is locked, so the revision check cannot lose; it
                // stays as a guard against writes outside this store.
                if Self::write_row(&mut *tx, &next).await? == 1 {
                    claimed.push(next);
                }
            }

            tx.commit().await?;
        }

        Ok(claimed)
    }

    async fn list(&self, filter: &Filter, pagination: &Pagination) -> Result<Vec<Work>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT doc FROM work_items
             WHERE ($1::text[] IS NULL OR work_type = ANY($1))
               AND ($2::text IS NULL OR group_id = $2)
             ORDER BY created_time ASC
             LIMIT $3 OFFSET $4",
        )
        .bind(filter.types.as_deref())
        .bind(filter.group_id.as_deref())
        .bind(pagination.size as i64)
        .bind((pagination.page * pagination.size) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(doc,)| work_from_doc(doc)).collect()
    }

    async fn create(&self, create: &Create) -> Result<Work> {
        let now = Utc::now();
        let work = Work::from_create(create, now)?;
        let doc = serde_json::to_value(&work)
            .map_err(|e| Error::Other(format!("serialize work item: {e}")))?;

        // The partial unique index on deduplication_id rejects concurrent
        // duplicate submissions; ON CONFLICT turns that into no insert.
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO work_items (
                 id, work_type, group_id, deduplication_id, serial_id, state,
                 processing_priority, processing_available_time, created_time,
                 revision, doc
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (deduplication_id) WHERE deduplication_id IS NOT NULL
                 AND state NOT IN ('failed', 'success')
             DO NOTHING
             RETURNING id",
        )
        .bind(work.id.as_str())
        .bind(&work.work_type)
        .bind(work.group_id.as_deref())
        .bind(work.deduplication_id.as_deref())
        .bind(work.serial_id.as_deref())
        .bind(work.state.to_string())
        .bind(work.processing_priority)
        .bind(work.processing_available_time)
        .bind(work.created_time)
        .bind(work.revision)
        .bind(&doc)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            return Err(Error::Duplicate(
                work.deduplication_id.clone().unwrap_or_default(),
            ));
        }
        Ok(work)
    }

    async fn get(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT doc FROM work_items WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            None => Ok(None),
            Some((doc,)) => {
                let work = work_from_doc(doc)?;
                Ok(Some(work).filter(|w| condition.revision.is_none_or(|r| r == w.revision)))
            }
        }
    }

    async fn update(&self, id: &WorkId, condition: &Condition, update: &Update) -> Result<Work> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT doc FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let (doc,) = row.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let work = work_from_doc(doc)?;

        if let Some(expected) = condition.revision {
            if expected != work.revision {
                return Err(Error::RevisionConflict {
                    id: id.to_string(),
                    expected,
                    actual: work.revision,
                });
            }
        }

        let next = work.applying(update, now)?;
        if Self::write_row(&mut *tx, &next).await? != 1 {
            return Err(Error::RevisionConflict {
                id: id.to_string(),
                expected: work.revision,
                actual: next.revision,
            });
        }
        tx.commit().await?;
        Ok(next)
    }

    async fn delete(&self, id: &WorkId, condition: &Condition) -> Result<Option<Work>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT doc FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((doc,)) = row else {
            return Ok(None);
        };
        let work = work_from_doc(doc)?;

        if let Some(expected) = condition.revision {
            if expected != work.revision {
                return Err(Error::RevisionConflict {
                    id: id.to_string(),
                    expected,
                    actual: work.revision,
                });
            }
        }

        sqlx::query("DELETE FROM work_items WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(work))
    }

    async fn delete_all_by_group_id(&self, group_id: &str) -> Result<usize> {
        let affected = sqlx::query("DELETE FROM work_items WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected as usize)
    }
}
