//! PostgreSQL repositories backed by a shared sqlx pool.
//!
//! All queries are parameterized (`$n` binds only) and every tenant-scoped
//! predicate carries the tenant filter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use courier_domain::model::{
    Artifact, AuditEvent, AuditEventType, DeliveryReceipt, ExecutionRun, ReportDefinition,
    RunMetadata, Schedule,
};

use super::{
    decode_cursor, encode_cursor, ArtifactRepo, AuditRepo, DefinitionRepo, ReceiptRepo, RunRepo,
    ScheduleRepo, SchedulePage, StoreError, StoreResult, Stores, MAX_PAGE_LIMIT,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with the configured pool sizing (base + overflow).
    pub async fn connect(
        database_url: &str,
        pool_size: u32,
        max_overflow: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size + max_overflow)
            .min_connections(pool_size.min(1))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the idempotent schema (tables + indexes).
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Expose all repositories over one shared pool.
    pub fn stores(self) -> Stores {
        let store = Arc::new(self);
        Stores {
            schedules: store.clone(),
            definitions: store.clone(),
            runs: store.clone(),
            artifacts: store.clone(),
            receipts: store.clone(),
            audit: store,
        }
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref dbe) = err {
        if dbe.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Conflict(dbe.to_string());
        }
    }
    StoreError::Database(err.to_string())
}

fn decode_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("row decode: {err}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mappers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn schedule_from_row(row: &PgRow) -> StoreResult<Schedule> {
    let email: Option<serde_json::Value> =
        row.try_get("email_delivery_config").map_err(decode_err)?;
    Ok(Schedule {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        report_definition_id: row.try_get("report_definition_id").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        cron_expression: row.try_get("cron_expression").map_err(decode_err)?,
        timezone: row.try_get("timezone").map_err(decode_err)?,
        active: row.try_get("is_active").map_err(decode_err)?,
        next_run_at: row.try_get("next_run_at").map_err(decode_err)?,
        last_run_at: row.try_get("last_run_at").map_err(decode_err)?,
        email_delivery_config: email
            .map(serde_json::from_value)
            .transpose()
            .map_err(decode_err)?,
        last_error: row.try_get("last_error").map_err(decode_err)?,
        created_by: row.try_get("created_by").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
    })
}

fn definition_from_row(row: &PgRow) -> StoreResult<ReportDefinition> {
    let format: String = row.try_get("output_format").map_err(decode_err)?;
    let ttl: i64 = row.try_get("cache_ttl_seconds").map_err(decode_err)?;
    Ok(ReportDefinition {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        query_spec: row.try_get("query_spec").map_err(decode_err)?,
        template_ref: row.try_get("template_ref").map_err(decode_err)?,
        output_format: format.parse().map_err(decode_err)?,
        cache_ttl_seconds: ttl.max(0) as u64,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<ExecutionRun> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(decode_err)?;
    Ok(ExecutionRun {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        schedule_id: row.try_get("schedule_id").map_err(decode_err)?,
        report_definition_id: row.try_get("report_definition_id").map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        started_at: row.try_get("started_at").map_err(decode_err)?,
        completed_at: row.try_get("completed_at").map_err(decode_err)?,
        duration_seconds: row.try_get("duration_seconds").map_err(decode_err)?,
        error_message: row.try_get("error_message").map_err(decode_err)?,
        metadata: serde_json::from_value::<RunMetadata>(metadata).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

fn artifact_from_row(row: &PgRow) -> StoreResult<Artifact> {
    let format: String = row.try_get("file_format").map_err(decode_err)?;
    let size: i64 = row.try_get("file_size_bytes").map_err(decode_err)?;
    Ok(Artifact {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        execution_run_id: row.try_get("execution_run_id").map_err(decode_err)?,
        blob_path: row.try_get("blob_path").map_err(decode_err)?,
        file_size_bytes: size.max(0) as u64,
        file_format: format.parse().map_err(decode_err)?,
        signed_url: row.try_get("signed_url").map_err(decode_err)?,
        signed_url_expires_at: row.try_get("signed_url_expires_at").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

fn receipt_from_row(row: &PgRow) -> StoreResult<DeliveryReceipt> {
    let channel: String = row.try_get("channel").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    Ok(DeliveryReceipt {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        artifact_id: row.try_get("artifact_id").map_err(decode_err)?,
        channel: channel.parse().map_err(decode_err)?,
        recipient: row.try_get("recipient").map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        sent_at: row.try_get("sent_at").map_err(decode_err)?,
        error_message: row.try_get("error_message").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

fn audit_from_row(row: &PgRow) -> StoreResult<AuditEvent> {
    let event_type: String = row.try_get("event_type").map_err(decode_err)?;
    Ok(AuditEvent {
        id: row.try_get("id").map_err(decode_err)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
        event_type: event_type.parse().map_err(decode_err)?,
        resource_type: row.try_get("resource_type").map_err(decode_err)?,
        resource_id: row.try_get("resource_id").map_err(decode_err)?,
        event_data: row.try_get("event_data").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScheduleRepo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SCHEDULE_COLUMNS: &str = "id, tenant_id, report_definition_id, name, cron_expression, \
     timezone, is_active, next_run_at, last_run_at, email_delivery_config, last_error, \
     created_by, created_at, updated_at";

const SCHEDULE_UPDATE_SQL: &str =
    "UPDATE schedule SET name = $3, cron_expression = $4, timezone = $5, is_active = $6, \
     next_run_at = $7, last_run_at = $8, email_delivery_config = $9, last_error = $10, \
     updated_at = $11 WHERE id = $1 AND tenant_id = $2";

#[async_trait]
impl ScheduleRepo for PgStore {
    async fn create(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let email = schedule
            .email_delivery_config
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(decode_err)?;
        sqlx::query(
            "INSERT INTO schedule (id, tenant_id, report_definition_id, name, cron_expression, \
             timezone, is_active, next_run_at, last_run_at, email_delivery_config, last_error, \
             created_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(schedule.id)
        .bind(schedule.tenant_id)
        .bind(schedule.report_definition_id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(schedule.active)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(email)
        .bind(&schedule.last_error)
        .bind(&schedule.created_by)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(schedule)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list(
        &self,
        tenant_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
        active: Option<bool>,
    ) -> StoreResult<SchedulePage> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let fetch = (limit + 1) as i64;
        let after = cursor.and_then(decode_cursor);

        // Four fixed query shapes; all values bound, never interpolated.
        let rows = match (after, active) {
            (None, None) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedule WHERE tenant_id = $1 \
                     ORDER BY created_at DESC, id DESC LIMIT $2"
                ))
                .bind(tenant_id)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            (None, Some(a)) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedule WHERE tenant_id = $1 \
                     AND is_active = $2 ORDER BY created_at DESC, id DESC LIMIT $3"
                ))
                .bind(tenant_id)
                .bind(a)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            (Some((at, id)), None) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedule WHERE tenant_id = $1 \
                     AND (created_at, id) < ($2, $3) \
                     ORDER BY created_at DESC, id DESC LIMIT $4"
                ))
                .bind(tenant_id)
                .bind(at)
                .bind(id)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            (Some((at, id)), Some(a)) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedule WHERE tenant_id = $1 \
                     AND is_active = $2 AND (created_at, id) < ($3, $4) \
                     ORDER BY created_at DESC, id DESC LIMIT $5"
                ))
                .bind(tenant_id)
                .bind(a)
                .bind(at)
                .bind(id)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        let mut items = rows
            .iter()
            .map(schedule_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|s| encode_cursor(s.created_at, s.id))
        } else {
            None
        };
        Ok(SchedulePage { items, next_cursor })
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule \
             WHERE is_active = TRUE AND next_run_at IS NOT NULL AND next_run_at <= $1 \
             ORDER BY next_run_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update(&self, mut schedule: Schedule) -> StoreResult<Schedule> {
        schedule.updated_at = Utc::now();
        let email = schedule
            .email_delivery_config
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(decode_err)?;
        let result = sqlx::query(SCHEDULE_UPDATE_SQL)
            .bind(schedule.id)
            .bind(schedule.tenant_id)
            .bind(&schedule.name)
            .bind(&schedule.cron_expression)
            .bind(&schedule.timezone)
            .bind(schedule.active)
            .bind(schedule.next_run_at)
            .bind(schedule.last_run_at)
            .bind(email)
            .bind(&schedule.last_error)
            .bind(schedule.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(schedule)
    }

    async fn update_all(&self, schedules: Vec<Schedule>) -> StoreResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for mut schedule in schedules {
            schedule.updated_at = now;
            let email = schedule
                .email_delivery_config
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(decode_err)?;
            sqlx::query(SCHEDULE_UPDATE_SQL)
                .bind(schedule.id)
                .bind(schedule.tenant_id)
                .bind(&schedule.name)
                .bind(&schedule.cron_expression)
                .bind(&schedule.timezone)
                .bind(schedule.active)
                .bind(schedule.next_run_at)
                .bind(schedule.last_run_at)
                .bind(email)
                .bind(&schedule.last_error)
                .bind(schedule.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM schedule WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self, tenant_id: Uuid, active: Option<bool>) -> StoreResult<usize> {
        let row = match active {
            None => sqlx::query("SELECT COUNT(*) AS n FROM schedule WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await,
            Some(a) => sqlx::query(
                "SELECT COUNT(*) AS n FROM schedule WHERE tenant_id = $1 AND is_active = $2",
            )
            .bind(tenant_id)
            .bind(a)
            .fetch_one(&self.pool)
            .await,
        }
        .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(decode_err)?;
        Ok(n.max(0) as usize)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DefinitionRepo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl DefinitionRepo for PgStore {
    async fn create(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition> {
        sqlx::query(
            "INSERT INTO report_definition (id, tenant_id, name, query_spec, template_ref, \
             output_format, cache_ttl_seconds, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(definition.id)
        .bind(definition.tenant_id)
        .bind(&definition.name)
        .bind(&definition.query_spec)
        .bind(&definition.template_ref)
        .bind(definition.output_format.extension())
        .bind(definition.cache_ttl_seconds as i64)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(definition)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ReportDefinition>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, query_spec, template_ref, output_format, \
             cache_ttl_seconds, created_at FROM report_definition \
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn update(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition> {
        let result = sqlx::query(
            "UPDATE report_definition SET name = $3, query_spec = $4, template_ref = $5, \
             output_format = $6, cache_ttl_seconds = $7 WHERE id = $1 AND tenant_id = $2",
        )
        .bind(definition.id)
        .bind(definition.tenant_id)
        .bind(&definition.name)
        .bind(&definition.query_spec)
        .bind(&definition.template_ref)
        .bind(definition.output_format.extension())
        .bind(definition.cache_ttl_seconds as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(definition)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunRepo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const RUN_COLUMNS: &str = "id, tenant_id, schedule_id, report_definition_id, status, \
     started_at, completed_at, duration_seconds, error_message, metadata, created_at";

#[async_trait]
impl RunRepo for PgStore {
    async fn insert(&self, run: ExecutionRun) -> StoreResult<ExecutionRun> {
        let metadata = serde_json::to_value(&run.metadata).map_err(decode_err)?;
        sqlx::query(
            "INSERT INTO execution_run (id, tenant_id, schedule_id, report_definition_id, \
             status, started_at, completed_at, duration_seconds, error_message, metadata, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(run.schedule_id)
        .bind(run.report_definition_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .bind(&run.error_message)
        .bind(metadata)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(run)
    }

    async fn update(&self, run: ExecutionRun) -> StoreResult<ExecutionRun> {
        let metadata = serde_json::to_value(&run.metadata).map_err(decode_err)?;
        let result = sqlx::query(
            "UPDATE execution_run SET status = $3, completed_at = $4, duration_seconds = $5, \
             error_message = $6, metadata = $7 WHERE id = $1 AND tenant_id = $2",
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .bind(&run.error_message)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(run)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ExecutionRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_run WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_completed(
        &self,
        tenant_id: Uuid,
        report_definition_id: Uuid,
    ) -> StoreResult<Option<ExecutionRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_run \
             WHERE tenant_id = $1 AND report_definition_id = $2 AND status = 'completed' \
             ORDER BY completed_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(report_definition_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn running_counts(&self) -> StoreResult<Vec<(Uuid, i64)>> {
        let rows = sqlx::query(
            "SELECT tenant_id, COUNT(*) AS n FROM execution_run \
             WHERE status IN ('pending', 'running') GROUP BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let tenant: Uuid = row.try_get("tenant_id").map_err(decode_err)?;
                let n: i64 = row.try_get("n").map_err(decode_err)?;
                Ok((tenant, n))
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ArtifactRepo / ReceiptRepo / AuditRepo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ARTIFACT_COLUMNS: &str = "id, tenant_id, execution_run_id, blob_path, file_size_bytes, \
     file_format, signed_url, signed_url_expires_at, created_at";

#[async_trait]
impl ArtifactRepo for PgStore {
    async fn insert(&self, artifact: Artifact) -> StoreResult<Artifact> {
        sqlx::query(
            "INSERT INTO artifact (id, tenant_id, execution_run_id, blob_path, \
             file_size_bytes, file_format, signed_url, signed_url_expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(artifact.id)
        .bind(artifact.tenant_id)
        .bind(artifact.execution_run_id)
        .bind(&artifact.blob_path)
        .bind(artifact.file_size_bytes as i64)
        .bind(artifact.file_format.extension())
        .bind(&artifact.signed_url)
        .bind(artifact.signed_url_expires_at)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(artifact)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Artifact>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifact WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn find_by_run(
        &self,
        execution_run_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<Artifact>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifact \
             WHERE execution_run_id = $1 AND tenant_id = $2"
        ))
        .bind(execution_run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn find_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Artifact>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifact WHERE created_at < $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM artifact WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReceiptRepo for PgStore {
    async fn insert(&self, receipt: DeliveryReceipt) -> StoreResult<DeliveryReceipt> {
        sqlx::query(
            "INSERT INTO delivery_receipt (id, tenant_id, artifact_id, channel, recipient, \
             status, sent_at, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(receipt.id)
        .bind(receipt.tenant_id)
        .bind(receipt.artifact_id)
        .bind(receipt.channel.as_str())
        .bind(&receipt.recipient)
        .bind(receipt.status.as_str())
        .bind(receipt.sent_at)
        .bind(&receipt.error_message)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(receipt)
    }

    async fn list_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, artifact_id, channel, recipient, status, sent_at, \
             error_message, created_at FROM delivery_receipt \
             WHERE tenant_id = $1 AND artifact_id = $2 ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .bind(artifact_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(receipt_from_row).collect()
    }
}

const AUDIT_COLUMNS: &str =
    "id, tenant_id, event_type, resource_type, resource_id, event_data, created_at";

#[async_trait]
impl AuditRepo for PgStore {
    async fn insert(&self, event: AuditEvent) -> StoreResult<AuditEvent> {
        sqlx::query(
            "INSERT INTO audit_event (id, tenant_id, event_type, resource_type, resource_id, \
             event_data, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.event_type.as_str())
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.event_data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(event)
    }

    async fn trail_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_event \
             WHERE tenant_id = $1 AND resource_type = 'artifact' AND resource_id = $2 \
             ORDER BY created_at DESC LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(artifact_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn for_user(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        event_types: Option<&[AuditEventType]>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = match event_types {
            None => {
                sqlx::query(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_event \
                     WHERE tenant_id = $1 AND event_data->>'user_id' = $2 \
                     ORDER BY created_at DESC LIMIT $3"
                ))
                .bind(tenant_id)
                .bind(user_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(types) => {
                let names: Vec<String> =
                    types.iter().map(|t| t.as_str().to_string()).collect();
                sqlx::query(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_event \
                     WHERE tenant_id = $1 AND event_data->>'user_id' = $2 \
                     AND event_type = ANY($3) ORDER BY created_at DESC LIMIT $4"
                ))
                .bind(tenant_id)
                .bind(user_id)
                .bind(names)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_event \
             WHERE tenant_id = $1 AND created_at >= $2 AND created_at <= $3 \
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(audit_from_row).collect()
    }
}
