use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::db::store::{
    ChunkCheckpoint, DatasetStore, ExternalJobStore, JobStore, LockAttempt, LockStore,
    ReclaimReport, Registration,
};
use crate::error::StoreError;
use crate::models::change::{Change, ChangeKind, NewChange};
use crate::models::dataset::{Dataset, DatasetLock, Label, LockHolder, NewDataset};
use crate::models::external_job::{ExternalJob, ExternalStatus, NewExternalJob, StatusReport};
use crate::models::job::{ClaimToken, Job, JobProgress, JobState, NewJob};
use crate::models::mutation::{ChunkOutcome, Mutation};

const DATASET_COLUMNS: &str =
    "id, owner_id, name, description, share_mode, created_at, modified_at";
const CHANGE_COLUMNS: &str = "id, dataset_id, user_id, kind, summary, job_id, created_at";
const LOCK_COLUMNS: &str = "dataset_id, holder, acquired_at, lease_expires_at";
const JOB_COLUMNS: &str = "id, dataset_id, user_id, payload, state, attempts, claimed_by, \
     claim_token, visibility_deadline, available_at, expires_at, progress_items, \
     progress_matched, last_error, created_at, updated_at";
const EXTERNAL_COLUMNS: &str = "id, dataset_id, user_id, external_id, app_name, status, \
     last_state, last_status, reconciled, started_at, last_polled_at, finished_at, result_job_id";

/// Session advisory lock held by the one worker running the External Job Watcher.
pub const WATCHER_LOCK_KEY: i64 = 0x6173_7472_6f76_7721;

/// Postgres implementation of every storage trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Take a session advisory lock on a connection of its own, or `None`
    /// when another session holds it. The lock lives until the returned
    /// [`SessionLock`] is released or its connection closes.
    pub async fn try_session_lock(&self, key: i64) -> Result<Option<SessionLock>, StoreError> {
        let mut conn = self.pool.acquire().await?.detach();
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?;

        if !locked {
            conn.close().await?;
            return Ok(None);
        }
        Ok(Some(SessionLock { conn, key }))
    }
}

/// A held Postgres advisory lock. Dropping it closes the connection, which
/// also ends the lock.
pub struct SessionLock {
    conn: PgConnection,
    key: i64,
}

impl SessionLock {
    pub async fn release(mut self) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut self.conn)
            .await?;
        self.conn.close().await?;
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unexpected {column} value '{raw}'")))
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset, StoreError> {
    Ok(Dataset {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        share_mode: parse_column(row, "share_mode")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<Change, StoreError> {
    Ok(Change {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        user_id: row.try_get("user_id")?,
        kind: parse_column(row, "kind")?,
        summary: row.try_get("summary")?,
        job_id: row.try_get("job_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn lock_from_row(row: &PgRow) -> Result<DatasetLock, StoreError> {
    Ok(DatasetLock {
        dataset_id: row.try_get("dataset_id")?,
        holder: LockHolder::from_raw(row.try_get::<String, _>("holder")?),
        acquired_at: row.try_get("acquired_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(Job {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        user_id: row.try_get("user_id")?,
        payload: serde_json::from_value(payload)?,
        state: parse_column(row, "state")?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        claimed_by: row.try_get("claimed_by")?,
        claim_token: row.try_get("claim_token")?,
        visibility_deadline: row.try_get("visibility_deadline")?,
        available_at: row.try_get("available_at")?,
        expires_at: row.try_get("expires_at")?,
        progress: JobProgress {
            items: to_u64(row.try_get("progress_items")?),
            matched: to_u64(row.try_get("progress_matched")?),
        },
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn external_from_row(row: &PgRow) -> Result<ExternalJob, StoreError> {
    Ok(ExternalJob {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        user_id: row.try_get("user_id")?,
        external_id: row.try_get("external_id")?,
        app_name: row.try_get("app_name")?,
        status: parse_column(row, "status")?,
        last_state: row.try_get("last_state")?,
        last_status: row.try_get("last_status")?,
        reconciled: row.try_get("reconciled")?,
        started_at: row.try_get("started_at")?,
        last_polled_at: row.try_get("last_polled_at")?,
        finished_at: row.try_get("finished_at")?,
        result_job_id: row.try_get("result_job_id")?,
    })
}

/// Image ids in `dataset_id` whose names are in `names`.
async fn select_image_ids(
    conn: &mut PgConnection,
    dataset_id: i64,
    names: &[String],
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT id FROM images
        WHERE dataset_id = $1 AND name = ANY($2)
        ORDER BY id
        "#,
    )
    .bind(dataset_id)
    .bind(names)
    .fetch_all(&mut *conn)
    .await
}

async fn insert_labels(
    conn: &mut PgConnection,
    dataset_id: i64,
    label_id: i64,
    names: &[String],
) -> Result<ChunkOutcome, sqlx::Error> {
    let image_ids = select_image_ids(conn, dataset_id, names).await?;
    if image_ids.is_empty() {
        return Ok(ChunkOutcome::default());
    }

    let result = sqlx::query(
        r#"
        INSERT INTO image_labels (image_id, label_id, value)
        SELECT id, $2, 0 FROM UNNEST($1::bigint[]) AS t(id)
        ON CONFLICT (image_id, label_id) DO NOTHING
        "#,
    )
    .bind(&image_ids)
    .bind(label_id)
    .execute(&mut *conn)
    .await?;

    Ok(ChunkOutcome {
        matched: image_ids.len() as u64,
        affected: result.rows_affected(),
    })
}

async fn delete_labels(
    conn: &mut PgConnection,
    dataset_id: i64,
    label_id: i64,
    names: &[String],
) -> Result<ChunkOutcome, sqlx::Error> {
    let image_ids = select_image_ids(conn, dataset_id, names).await?;
    if image_ids.is_empty() {
        return Ok(ChunkOutcome::default());
    }

    let result = sqlx::query("DELETE FROM image_labels WHERE label_id = $1 AND image_id = ANY($2)")
        .bind(label_id)
        .bind(&image_ids)
        .execute(&mut *conn)
        .await?;

    Ok(ChunkOutcome {
        matched: image_ids.len() as u64,
        affected: result.rows_affected(),
    })
}

/// Copy matching source images, and their label associations, into the target.
/// Names already present in the target are left alone.
async fn copy_images(
    conn: &mut PgConnection,
    source_dataset_id: i64,
    target_dataset_id: i64,
    names: &[String],
) -> Result<ChunkOutcome, sqlx::Error> {
    let sources = sqlx::query(
        r#"
        SELECT id, name, path, metadata FROM images
        WHERE dataset_id = $1 AND name = ANY($2)
        ORDER BY id
        "#,
    )
    .bind(source_dataset_id)
    .bind(names)
    .fetch_all(&mut *conn)
    .await?;

    let mut outcome = ChunkOutcome {
        matched: sources.len() as u64,
        affected: 0,
    };

    for source in &sources {
        let source_id: i64 = source.try_get("id")?;
        let copy_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO images (dataset_id, name, path, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id, name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(target_dataset_id)
        .bind(source.try_get::<String, _>("name")?)
        .bind(source.try_get::<String, _>("path")?)
        .bind(source.try_get::<serde_json::Value, _>("metadata")?)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(copy_id) = copy_id else { continue };
        outcome.affected += 1;

        sqlx::query(
            r#"
            INSERT INTO image_labels (image_id, label_id, value)
            SELECT $1, label_id, value FROM image_labels WHERE image_id = $2
            ON CONFLICT (image_id, label_id) DO NOTHING
            "#,
        )
        .bind(copy_id)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(outcome)
}

#[async_trait]
impl DatasetStore for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_dataset(
        &self,
        dataset: NewDataset,
        now: DateTime<Utc>,
    ) -> Result<Dataset, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO datasets (owner_id, name, description, share_mode, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {DATASET_COLUMNS}
            "#
        ))
        .bind(&dataset.owner_id)
        .bind(&dataset.name)
        .bind(&dataset.description)
        .bind(dataset.share_mode.as_ref())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        dataset_from_row(&row)
    }

    async fn get_dataset(&self, dataset_id: i64) -> Result<Option<Dataset>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = $1"))
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn get_label(&self, label_id: i64) -> Result<Option<Label>, StoreError> {
        let row = sqlx::query("SELECT id, name, color FROM labels WHERE id = $1")
            .bind(label_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(r) => Some(Label {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                color: r.try_get("color")?,
            }),
            None => None,
        })
    }

    async fn apply_chunk(
        &self,
        dataset_id: i64,
        mutation: &Mutation,
        names: &[String],
        checkpoint: Option<ChunkCheckpoint>,
    ) -> Result<ChunkOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let outcome = match mutation {
            Mutation::AddImages {
                source_dataset_id, ..
            } => copy_images(&mut tx, *source_dataset_id, dataset_id, names).await?,
            Mutation::ApplyLabel { label_id, .. } => {
                insert_labels(&mut tx, dataset_id, *label_id, names).await?
            }
            Mutation::RemoveLabel { label_id, .. } => {
                delete_labels(&mut tx, dataset_id, *label_id, names).await?
            }
        };

        if let Some(checkpoint) = checkpoint {
            let result = sqlx::query(
                r#"
                UPDATE queue_jobs
                SET progress_items = $3, progress_matched = $4, updated_at = NOW()
                WHERE id = $1 AND claim_token = $2 AND state = 'processing'
                "#,
            )
            .bind(checkpoint.claim.job_id)
            .bind(checkpoint.claim.token)
            .bind(to_i64(checkpoint.before.items + names.len() as u64))
            .bind(to_i64(checkpoint.before.matched + outcome.matched))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                // Dropping the transaction rolls the chunk back.
                return Err(StoreError::ClaimLost {
                    job_id: checkpoint.claim.job_id,
                });
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn complete_mutation(
        &self,
        change: NewChange,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<Change>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO changes (dataset_id, user_id, kind, summary, job_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING {CHANGE_COLUMNS}
            "#
        ))
        .bind(change.dataset_id)
        .bind(&change.user_id)
        .bind(change.kind.as_ref())
        .bind(&change.summary)
        .bind(change.job_id)
        .bind(completed_at)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("UPDATE datasets SET modified_at = $2 WHERE id = $1")
            .bind(change.dataset_id)
            .bind(completed_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.as_ref().map(change_from_row).transpose()
    }

    async fn append_change(
        &self,
        change: NewChange,
        now: DateTime<Utc>,
    ) -> Result<Change, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO changes (dataset_id, user_id, kind, summary, job_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {CHANGE_COLUMNS}
            "#
        ))
        .bind(change.dataset_id)
        .bind(&change.user_id)
        .bind(change.kind.as_ref())
        .bind(&change.summary)
        .bind(change.job_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        change_from_row(&row)
    }

    async fn list_changes(&self, dataset_id: i64) -> Result<Vec<Change>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes WHERE dataset_id = $1 ORDER BY created_at, id"
        ))
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(change_from_row).collect()
    }
}

/// The upsert only overwrites a lease that is ours or expired. A miss means
/// someone else holds it, unless it was released in between.
async fn acquire_lease(
    conn: &mut PgConnection,
    dataset_id: i64,
    holder: &LockHolder,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<LockAttempt, StoreError> {
    for _ in 0..3 {
        let granted = sqlx::query(&format!(
            r#"
            INSERT INTO dataset_locks (dataset_id, holder, acquired_at, lease_expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = CASE
                    WHEN dataset_locks.holder = EXCLUDED.holder THEN dataset_locks.acquired_at
                    ELSE EXCLUDED.acquired_at
                END,
                lease_expires_at = EXCLUDED.lease_expires_at
            WHERE dataset_locks.holder = EXCLUDED.holder
               OR dataset_locks.lease_expires_at <= $3
            RETURNING {LOCK_COLUMNS}
            "#
        ))
        .bind(dataset_id)
        .bind(holder.as_str())
        .bind(now)
        .bind(lease_expires_at)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = granted {
            return Ok(LockAttempt::Granted(lock_from_row(&row)?));
        }

        let current = sqlx::query(&format!(
            "SELECT {LOCK_COLUMNS} FROM dataset_locks WHERE dataset_id = $1"
        ))
        .bind(dataset_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = current {
            return Ok(LockAttempt::Held(lock_from_row(&row)?));
        }
    }

    Err(StoreError::Corrupt(format!(
        "lock on dataset {dataset_id} kept changing hands"
    )))
}

/// Insert a job row inside the caller's transaction.
async fn insert_job_row(
    conn: &mut PgConnection,
    job_id: Uuid,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<Job, StoreError> {
    let payload = serde_json::to_value(&job.payload)?;
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO queue_jobs (id, dataset_id, user_id, payload, state, available_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'enqueued', $5, $5, $5)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(job.dataset_id)
    .bind(&job.user_id)
    .bind(payload)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    job_from_row(&row)
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let mut conn = self.pool.acquire().await?;
        acquire_lease(&mut conn, dataset_id, holder, now, lease_expires_at).await
    }

    async fn renew(
        &self,
        dataset_id: i64,
        holder: &LockHolder,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE dataset_locks SET lease_expires_at = $3 WHERE dataset_id = $1 AND holder = $2",
        )
        .bind(dataset_id)
        .bind(holder.as_str())
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, dataset_id: i64, holder: &LockHolder) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM dataset_locks WHERE dataset_id = $1 AND holder = $2")
            .bind(dataset_id)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn force_release(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM dataset_locks WHERE dataset_id = $1 RETURNING {LOCK_COLUMNS}"
        ))
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn current_lock(&self, dataset_id: i64) -> Result<Option<DatasetLock>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOCK_COLUMNS} FROM dataset_locks WHERE dataset_id = $1"
        ))
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lock_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_job_row(&mut conn, Uuid::new_v4(), &job, now).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        visibility_deadline: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs
            SET state = 'processing',
                attempts = attempts + 1,
                claimed_by = $1,
                claim_token = $2,
                visibility_deadline = $4,
                updated_at = $3
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE state = 'enqueued' AND available_at <= $3
                ORDER BY available_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(visibility_deadline)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_succeeded(
        &self,
        claim: ClaimToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'succeeded', claim_token = NULL, visibility_deadline = NULL,
                last_error = NULL, expires_at = $4, updated_at = $3
            WHERE id = $1 AND claim_token = $2 AND state = 'processing'
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        claimed(result.rows_affected(), claim)
    }

    async fn mark_awaiting_retry(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'awaiting_retry', claim_token = NULL, visibility_deadline = NULL,
                last_error = $3, available_at = $5, updated_at = $4
            WHERE id = $1 AND claim_token = $2 AND state = 'processing'
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(error)
        .bind(now)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        claimed(result.rows_affected(), claim)
    }

    async fn mark_failed(
        &self,
        claim: ClaimToken,
        error: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'failed', claim_token = NULL, visibility_deadline = NULL,
                last_error = $3, expires_at = $5, updated_at = $4
            WHERE id = $1 AND claim_token = $2 AND state = 'processing'
            "#,
        )
        .bind(claim.job_id)
        .bind(claim.token)
        .bind(error)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        claimed(result.rows_affected(), claim)
    }

    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'enqueued', updated_at = $1
            WHERE state = 'awaiting_retry' AND available_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        failed_expires_at: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = CASE WHEN attempts >= $2 THEN 'failed' ELSE 'enqueued' END,
                expires_at = CASE WHEN attempts >= $2 THEN $3 ELSE NULL END,
                claim_token = NULL,
                visibility_deadline = NULL,
                available_at = $1,
                last_error = 'visibility timeout elapsed',
                updated_at = $1
            WHERE state = 'processing' AND visibility_deadline <= $1
            RETURNING state
            "#,
        )
        .bind(now)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(failed_expires_at)
        .fetch_all(&self.pool)
        .await?;

        let mut report = ReclaimReport::default();
        for row in &rows {
            match parse_column::<JobState>(row, "state")? {
                JobState::Failed => report.failed += 1,
                _ => report.requeued += 1,
            }
        }
        Ok(report)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE expires_at IS NOT NULL AND expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM queue_jobs
            WHERE $1::text IS NULL OR state = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(state.map(|s| s.as_ref().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM queue_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<(JobState, i64), StoreError> {
                Ok((parse_column(r, "state")?, r.try_get("count")?))
            })
            .collect()
    }
}

fn claimed(rows_affected: u64, claim: ClaimToken) -> Result<(), StoreError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(StoreError::ClaimLost {
            job_id: claim.job_id,
        })
    }
}

async fn external_job_by_external_id(
    conn: &mut PgConnection,
    external_id: &str,
) -> Result<Option<ExternalJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {EXTERNAL_COLUMNS} FROM external_jobs WHERE external_id = $1"
    ))
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(external_from_row).transpose()
}

#[async_trait]
impl ExternalJobStore for PgStore {
    async fn register_external_job(
        &self,
        job: NewExternalJob,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO external_jobs (dataset_id, user_id, external_id, app_name, started_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING {EXTERNAL_COLUMNS}
            "#
        ))
        .bind(job.dataset_id)
        .bind(&job.user_id)
        .bind(&job.external_id)
        .bind(&job.app_name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            return match external_job_by_external_id(&mut tx, &job.external_id).await? {
                Some(existing) => Ok(Registration::Duplicate(existing)),
                None => Err(StoreError::Corrupt(format!(
                    "external job {} conflicted but is gone",
                    job.external_id
                ))),
            };
        };
        let registered = external_from_row(&row)?;

        match acquire_lease(
            &mut tx,
            job.dataset_id,
            &registered.lock_holder(),
            now,
            lease_expires_at,
        )
        .await?
        {
            LockAttempt::Granted(_) => {
                tx.commit().await?;
                Ok(Registration::Registered(registered))
            }
            // Dropping the transaction discards the handle.
            LockAttempt::Held(lock) => Ok(Registration::Locked(lock)),
        }
    }

    async fn list_unreconciled(&self) -> Result<Vec<ExternalJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXTERNAL_COLUMNS} FROM external_jobs WHERE reconciled = FALSE ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(external_from_row).collect()
    }

    async fn record_poll(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE external_jobs
            SET last_state = $2, last_status = $3, last_polled_at = $4
            WHERE id = $1 AND reconciled = FALSE
            "#,
        )
        .bind(id)
        .bind(&report.state)
        .bind(&report.detail)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reconcile(
        &self,
        id: i64,
        report: &StatusReport,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result_job_id = Uuid::new_v4();

        let row = sqlx::query(&format!(
            r#"
            UPDATE external_jobs
            SET status = $2, last_state = $3, last_status = $4,
                last_polled_at = $5, finished_at = $5, reconciled = TRUE,
                result_job_id = $6
            WHERE id = $1 AND reconciled = FALSE
            RETURNING {EXTERNAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(report.status.as_ref())
        .bind(&report.state)
        .bind(&report.detail)
        .bind(now)
        .bind(result_job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = external_from_row(&row)?;

        let kind = match report.status {
            ExternalStatus::Succeeded => ChangeKind::ExternalJobSucceeded,
            _ => ChangeKind::ExternalJobFailed,
        };
        sqlx::query(
            r#"
            INSERT INTO changes (dataset_id, user_id, kind, summary, job_id, created_at)
            VALUES ($1, $2, $3, $4, NULL, $5)
            "#,
        )
        .bind(job.dataset_id)
        .bind(&job.user_id)
        .bind(kind.as_ref())
        .bind(reconcile_summary(&job, report))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let follow_up = insert_job_row(&mut tx, result_job_id, &job.output_job(), now).await?;

        sqlx::query("DELETE FROM dataset_locks WHERE dataset_id = $1 AND holder = $2")
            .bind(job.dataset_id)
            .bind(job.lock_holder().as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(follow_up))
    }

    async fn purge_reconciled(&self, finished_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM external_jobs WHERE reconciled = TRUE AND finished_at <= $1",
        )
        .bind(finished_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Audit text for a reconciled external job.
pub(crate) fn reconcile_summary(job: &ExternalJob, report: &StatusReport) -> String {
    format!(
        "{} job {} finished: {} ({})",
        job.app_name, job.external_id, report.state, report.detail
    )
}
