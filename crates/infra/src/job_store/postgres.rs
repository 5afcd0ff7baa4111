//! Postgres-backed job record store.
//!
//! One row per job in the `jobs` table. Each slot is a pair of columns
//! (`<slot>_successful BOOLEAN`, `<slot>_result JSONB`) and every mutation is a
//! single-row `UPDATE ... WHERE job_id = $1`, so concurrent branch writers touch
//! disjoint columns. `rows_affected()` is the matched count.
//!
//! ## Index verification
//!
//! `ensure_indexes` runs once per handle:
//! 1. An in-process mutex serialises callers; a flag short-circuits later calls
//! 2. The catalog (`pg_indexes`) is checked first
//! 3. Missing objects are created inside a transaction holding
//!    `pg_advisory_xact_lock`, so concurrent processes cannot race

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use waypoint_core::{
    CompletionStatus, DirectionsResult, GeocodingResult, ImagingResult, Job, JobId, JobStatus,
    MessageId, NewJob, Slot, WeatherResult,
};

use super::{CompletionClaim, InsertOutcome, JobStore, JobStoreError};

/// Advisory lock key guarding schema/index creation ("waypoint" in ASCII).
const INDEX_LOCK_KEY: i64 = 0x7761_7970_6f69_6e74;

const JOB_ID_INDEX: &str = "jobs_job_id_key";
const IDEMPOTENCY_INDEX: &str = "jobs_idempotency_key_created_at_idx";

/// Only the schema the pool resolves `jobs` to counts.
const INDEXES_PRESENT_SQL: &str = r#"
    SELECT COUNT(*) AS present
    FROM pg_indexes
    WHERE schemaname = current_schema()
      AND tablename = 'jobs'
      AND indexname = ANY($1)
"#;

const JOB_COLUMNS: &str = r#"
    job_id,
    idempotency_key,
    created_at,
    starting_address,
    destination_address,
    email,
    status,
    additional_information,
    geocoding_successful,
    geocoding_result,
    directions_successful,
    directions_result,
    weather_successful,
    weather_result,
    imaging_successful,
    imaging_result
"#;

#[derive(Debug, Clone, Copy)]
enum SlotColumn {
    Geocoding,
    Directions,
    Weather,
    Imaging,
}

impl SlotColumn {
    fn update_sql(self) -> &'static str {
        match self {
            SlotColumn::Geocoding => {
                "UPDATE jobs SET geocoding_successful = $2, geocoding_result = $3 WHERE job_id = $1"
            }
            SlotColumn::Directions => {
                "UPDATE jobs SET directions_successful = $2, directions_result = $3 WHERE job_id = $1"
            }
            SlotColumn::Weather => {
                "UPDATE jobs SET weather_successful = $2, weather_result = $3 WHERE job_id = $1"
            }
            SlotColumn::Imaging => {
                "UPDATE jobs SET imaging_successful = $2, imaging_result = $3 WHERE job_id = $1"
            }
        }
    }
}

/// Postgres job store. Cheap to clone; clones share the pool and the index flag.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    indexes_verified: Arc<AtomicBool>,
    index_lock: Arc<Mutex<()>>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            indexes_verified: Arc::new(AtomicBool::new(false)),
            index_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn indexes_present(&self) -> Result<bool, JobStoreError> {
        let row = sqlx::query(INDEXES_PRESENT_SQL)
            .bind(vec![JOB_ID_INDEX.to_string(), IDEMPOTENCY_INDEX.to_string()])
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("indexes_present", e))?;

        let present: i64 = row
            .try_get("present")
            .map_err(|e| map_sqlx_error("indexes_present", e))?;
        Ok(present == 2)
    }

    async fn create_schema(&self) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(INDEX_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id UUID NOT NULL,
                idempotency_key TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                starting_address TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                email TEXT NOT NULL,
                status TEXT NOT NULL,
                additional_information TEXT,
                geocoding_successful BOOLEAN,
                geocoding_result JSONB,
                directions_successful BOOLEAN,
                directions_result JSONB,
                weather_successful BOOLEAN,
                weather_result JSONB,
                imaging_successful BOOLEAN,
                imaging_result JSONB,
                completion_claimed_by UUID,
                completion_published BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS jobs_job_id_key ON jobs (job_id)",
            r#"
            CREATE INDEX IF NOT EXISTS jobs_idempotency_key_created_at_idx
                ON jobs (idempotency_key, created_at DESC)
            "#,
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_schema", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(())
    }

    async fn update_slot<T: Serialize>(
        &self,
        slot: SlotColumn,
        job_id: JobId,
        successful: bool,
        result: &T,
    ) -> Result<u64, JobStoreError> {
        let payload = serde_json::to_value(result).map_err(|e| JobStoreError::Corrupt {
            job_id,
            message: format!("failed to serialize {slot:?} result: {e}"),
        })?;

        let done = sqlx::query(slot.update_sql())
            .bind(job_id.as_uuid())
            .bind(successful)
            .bind(payload)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_slot", e))?;

        Ok(done.rows_affected())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn ensure_indexes(&self) -> Result<(), JobStoreError> {
        if self.indexes_verified.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.index_lock.lock().await;
        if self.indexes_verified.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.indexes_present().await? {
            debug!("job indexes already present");
        } else {
            self.create_schema().await?;
            info!("job table and indexes created");
        }

        self.indexes_verified.store(true, Ordering::Release);
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        let done = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id,
                idempotency_key,
                created_at,
                starting_address,
                destination_address,
                email,
                status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.idempotency_key.as_deref())
        .bind(job.created_at)
        .bind(&job.starting_address)
        .bind(&job.destination_address)
        .bind(&job.email)
        .bind(JobStatus::Accepted.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        Ok(if done.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job_by_id", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job_completion_status(
        &self,
        job_id: JobId,
    ) -> Result<Option<CompletionStatus>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                directions_successful IS NOT NULL AS directions_done,
                weather_successful IS NOT NULL AS weather_done,
                imaging_successful IS NOT NULL AS imaging_done
            FROM jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job_completion_status", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let get = |column: &str| -> Result<bool, JobStoreError> {
            row.try_get(column)
                .map_err(|e| map_sqlx_error("get_job_completion_status", e))
        };
        Ok(Some(CompletionStatus {
            directions_done: get("directions_done")?,
            weather_done: get("weather_done")?,
            imaging_done: get("imaging_done")?,
        }))
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn update_geocoding_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: GeocodingResult,
    ) -> Result<u64, JobStoreError> {
        self.update_slot(SlotColumn::Geocoding, job_id, successful, &result)
            .await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn update_directions_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: DirectionsResult,
    ) -> Result<u64, JobStoreError> {
        self.update_slot(SlotColumn::Directions, job_id, successful, &result)
            .await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn update_weather_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: WeatherResult,
    ) -> Result<u64, JobStoreError> {
        self.update_slot(SlotColumn::Weather, job_id, successful, &result)
            .await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn update_imaging_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: ImagingResult,
    ) -> Result<u64, JobStoreError> {
        self.update_slot(SlotColumn::Imaging, job_id, successful, &result)
            .await
    }

    #[instrument(skip(self, details), fields(job_id = %job_id, status = %status), err)]
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<u64, JobStoreError> {
        // A terminal row keeps its status unless the incoming one is terminal too.
        let done = sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE
                    WHEN status IN ('Failed', 'Complete') AND NOT $4 THEN status
                    ELSE $2
                END,
                additional_information = CASE
                    WHEN status IN ('Failed', 'Complete') AND NOT $4 THEN additional_information
                    ELSE $3
                END
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(details)
        .bind(status.is_terminal())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn find_job_by_idempotency_key(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| JobStoreError::Storage(format!("invalid idempotency window: {e}")))?;
        let cutoff: DateTime<Utc> = Utc::now() - window;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE idempotency_key = $1 AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(cutoff)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job_by_idempotency_key", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, claimant = %claimant), err)]
    async fn claim_completion(
        &self,
        job_id: JobId,
        claimant: MessageId,
    ) -> Result<Option<CompletionClaim>, JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET completion_claimed_by = $2
            WHERE job_id = $1
              AND NOT completion_published
              AND (completion_claimed_by IS NULL OR completion_claimed_by = $2)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(claimant.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_completion", e))?;

        if done.rows_affected() > 0 {
            return Ok(Some(CompletionClaim::Acquired));
        }

        // Lost the compare-and-set: find out why. `completion_published` only moves false → true.
        let row = sqlx::query("SELECT completion_published FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_completion", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let published: bool = row
            .try_get("completion_published")
            .map_err(|e| map_sqlx_error("claim_completion", e))?;

        Ok(Some(if published {
            CompletionClaim::AlreadyPublished
        } else {
            CompletionClaim::HeldElsewhere
        }))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_completion_published(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let done = sqlx::query("UPDATE jobs SET completion_published = TRUE WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_completion_published", e))?;
        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete_job_by_id(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let done = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job_by_id", e))?;
        Ok(done.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let job_id = JobId::from_uuid(
        row.try_get("job_id")
            .map_err(|e| map_sqlx_error("job_from_row", e))?,
    );
    let column = |e: sqlx::Error| JobStoreError::Corrupt {
        job_id,
        message: e.to_string(),
    };

    let status_text: String = row.try_get("status").map_err(column)?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| JobStoreError::Corrupt {
        job_id,
        message: format!("unknown status '{status_text}'"),
    })?;

    Ok(Job {
        job_id,
        idempotency_key: row.try_get("idempotency_key").map_err(column)?,
        created_at: row.try_get("created_at").map_err(column)?,
        starting_address: row.try_get("starting_address").map_err(column)?,
        destination_address: row.try_get("destination_address").map_err(column)?,
        email: row.try_get("email").map_err(column)?,
        status,
        additional_information: row.try_get("additional_information").map_err(column)?,
        geocoding: slot_from_row(row, job_id, "geocoding")?,
        directions: slot_from_row(row, job_id, "directions")?,
        weather: slot_from_row(row, job_id, "weather")?,
        imaging: slot_from_row(row, job_id, "imaging")?,
    })
}

fn slot_from_row<T: DeserializeOwned>(
    row: &PgRow,
    job_id: JobId,
    prefix: &str,
) -> Result<Slot<T>, JobStoreError> {
    let corrupt = |message: String| JobStoreError::Corrupt { job_id, message };

    let successful: Option<bool> = row
        .try_get(format!("{prefix}_successful").as_str())
        .map_err(|e| corrupt(e.to_string()))?;
    let payload: Option<JsonValue> = row
        .try_get(format!("{prefix}_result").as_str())
        .map_err(|e| corrupt(e.to_string()))?;

    let result = payload
        .map(serde_json::from_value::<T>)
        .transpose()
        .map_err(|e| corrupt(format!("{prefix}_result: {e}")))?;

    Ok(Slot { successful, result })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("unknown")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a disposable Postgres database in
    //! `WAYPOINT_TEST_DATABASE_URL`; they pass trivially when it is unset.

    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    async fn store() -> Option<PostgresJobStore> {
        let url = std::env::var("WAYPOINT_TEST_DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .ok()?;
        let store = PostgresJobStore::new(pool);
        store.ensure_indexes().await.ok()?;
        Some(store)
    }

    fn new_job() -> NewJob {
        NewJob {
            job_id: JobId::new(),
            idempotency_key: Some(format!("key-{}", uuid::Uuid::now_v7())),
            starting_address: "A".to_string(),
            destination_address: "B".to_string(),
            email: "someone@example.com".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn slot_updates_touch_only_their_columns() {
        assert!(SlotColumn::Weather.update_sql().contains("weather_successful = $2"));
        assert!(!SlotColumn::Weather.update_sql().contains("directions"));
        assert!(SlotColumn::Geocoding.update_sql().ends_with("WHERE job_id = $1"));
    }

    #[tokio::test]
    async fn ensure_indexes_is_idempotent() {
        let Some(store) = store().await else { return };
        store.ensure_indexes().await.unwrap();
        assert!(store.indexes_present().await.unwrap());
    }

    #[test]
    fn index_check_is_scoped_to_the_current_schema() {
        assert!(INDEXES_PRESENT_SQL.contains("schemaname = current_schema()"));
        assert!(INDEXES_PRESENT_SQL.contains("tablename = 'jobs'"));
    }

    #[tokio::test]
    async fn indexes_in_another_schema_are_not_counted() {
        let Some(store) = store().await else { return };
        let Ok(url) = std::env::var("WAYPOINT_TEST_DATABASE_URL") else { return };

        let schema = format!("waypoint_{}", uuid::Uuid::now_v7().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&*store.pool)
            .await
            .unwrap();

        let options = url
            .parse::<PgConnectOptions>()
            .unwrap()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        let scoped = PostgresJobStore::new(pool);

        // `public.jobs` already carries both indexes.
        assert!(!scoped.indexes_present().await.unwrap());
        scoped.ensure_indexes().await.unwrap();
        assert!(scoped.indexes_present().await.unwrap());
        scoped.insert_job(new_job()).await.unwrap();

        sqlx::query(&format!("DROP SCHEMA {schema} CASCADE"))
            .execute(&*store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_update_and_read_back() {
        let Some(store) = store().await else { return };
        let job = new_job();
        let id = job.job_id;

        assert_eq!(store.insert_job(job.clone()).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_job(job).await.unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(
            store
                .update_weather_slot(id, false, WeatherResult::failed("provider timeout"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .update_weather_slot(JobId::new(), true, WeatherResult::default())
                .await
                .unwrap(),
            0
        );

        let status = store.get_job_completion_status(id).await.unwrap().unwrap();
        assert!(status.weather_done && !status.directions_done);

        let stored = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Accepted);
        assert_eq!(stored.weather.successful, Some(false));

        store.delete_job_by_id(id).await.unwrap();
    }

    #[tokio::test]
    async fn completion_claim_round() {
        let Some(store) = store().await else { return };
        let job = new_job();
        let id = job.job_id;
        store.insert_job(job).await.unwrap();
        let (a, b) = (MessageId::new(), MessageId::new());

        assert_eq!(store.claim_completion(id, a).await.unwrap(), Some(CompletionClaim::Acquired));
        assert_eq!(
            store.claim_completion(id, b).await.unwrap(),
            Some(CompletionClaim::HeldElsewhere)
        );
        store.mark_completion_published(id).await.unwrap();
        assert_eq!(
            store.claim_completion(id, a).await.unwrap(),
            Some(CompletionClaim::AlreadyPublished)
        );

        store.delete_job_by_id(id).await.unwrap();
    }
}
