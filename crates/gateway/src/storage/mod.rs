//! Repositories — tenant-scoped persistence behind per-entity traits.
//!
//! Two backends: `memory` (dev mode and tests) and `postgres` (sqlx,
//! parameterized queries only). Every read and write is filtered by
//! `tenant_id`; multi-tenant isolation is a security invariant, not a
//! convention.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_domain::model::{
    Artifact, AuditEvent, AuditEventType, DeliveryReceipt, ExecutionRun, ReportDefinition,
    Schedule,
};

/// Hard cap on page size for cursor-paginated listings.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Default batch for the scheduler's due-schedule query.
pub const DEFAULT_DUE_LIMIT: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database: {0}")]
    Database(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for courier_domain::ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => courier_domain::ServiceError::NotFound,
            other => courier_domain::ServiceError::Storage(other.to_string()),
        }
    }
}

/// One page of schedules plus the cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct SchedulePage {
    pub items: Vec<Schedule>,
    pub next_cursor: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque pagination cursor: base64 of `{"created_at": …, "id": …}` for the
/// last row of the previous page. The next page selects rows strictly less
/// than that tuple under `(created_at DESC, id DESC)` ordering.
pub fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    let payload = serde_json::json!({
        "created_at": created_at.to_rfc3339(),
        "id": id,
    });
    BASE64.encode(payload.to_string())
}

/// Decode a cursor. Malformed cursors are treated as "from the start".
pub fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let bytes = BASE64.decode(cursor).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let created_at = value
        .get("created_at")?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);
    let id = value.get("id")?.as_str().and_then(|s| s.parse().ok())?;
    Some((created_at, id))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ScheduleRepo: Send + Sync {
    async fn create(&self, schedule: Schedule) -> StoreResult<Schedule>;

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Schedule>>;

    /// Cursor-paginated listing ordered `(created_at DESC, id DESC)`.
    async fn list(
        &self,
        tenant_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
        active: Option<bool>,
    ) -> StoreResult<SchedulePage>;

    /// Active schedules with `next_run_at <= now`, ordered `next_run_at ASC`.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Schedule>>;

    /// Write current field values; the repository refreshes `updated_at`.
    async fn update(&self, schedule: Schedule) -> StoreResult<Schedule>;

    /// Persist a batch of schedule updates in a single transaction.
    async fn update_all(&self, schedules: Vec<Schedule>) -> StoreResult<()>;

    /// Returns whether the schedule existed.
    async fn delete(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<bool>;

    async fn count(&self, tenant_id: Uuid, active: Option<bool>) -> StoreResult<usize>;

    /// Backend liveness, used by the readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait DefinitionRepo: Send + Sync {
    async fn create(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition>;

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ReportDefinition>>;

    async fn update(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition>;
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    async fn insert(&self, run: ExecutionRun) -> StoreResult<ExecutionRun>;

    async fn update(&self, run: ExecutionRun) -> StoreResult<ExecutionRun>;

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ExecutionRun>>;

    /// Most recent completed run for a report definition (incremental ranges).
    async fn latest_completed(
        &self,
        tenant_id: Uuid,
        report_definition_id: Uuid,
    ) -> StoreResult<Option<ExecutionRun>>;

    /// `(tenant_id, count)` of pending+running runs — ground truth for the
    /// burst-protection counter sync.
    async fn running_counts(&self) -> StoreResult<Vec<(Uuid, i64)>>;
}

#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    /// Insert an artifact; at most one per execution run (unique constraint).
    async fn insert(&self, artifact: Artifact) -> StoreResult<Artifact>;

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Artifact>>;

    async fn find_by_run(
        &self,
        execution_run_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<Artifact>>;

    /// Artifacts (all tenants) created before `cutoff`, oldest first.
    async fn find_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Artifact>>;

    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait ReceiptRepo: Send + Sync {
    async fn insert(&self, receipt: DeliveryReceipt) -> StoreResult<DeliveryReceipt>;

    async fn list_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<DeliveryReceipt>>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn insert(&self, event: AuditEvent) -> StoreResult<AuditEvent>;

    /// Latest events for one artifact, newest first.
    async fn trail_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>>;

    /// Latest events recorded for a user, newest first, optionally filtered
    /// by event type.
    async fn for_user(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        event_types: Option<&[AuditEventType]>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>>;

    /// All events in `[start, end]`, oldest first.
    async fn between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEvent>>;
}

/// The full set of repositories, cloned cheaply into services.
#[derive(Clone)]
pub struct Stores {
    pub schedules: std::sync::Arc<dyn ScheduleRepo>,
    pub definitions: std::sync::Arc<dyn DefinitionRepo>,
    pub runs: std::sync::Arc<dyn RunRepo>,
    pub artifacts: std::sync::Arc<dyn ArtifactRepo>,
    pub receipts: std::sync::Arc<dyn ReceiptRepo>,
    pub audit: std::sync::Arc<dyn AuditRepo>,
}
