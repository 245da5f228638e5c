//! In-memory repositories — dev mode and test backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use courier_domain::model::{
    Artifact, AuditEvent, AuditEventType, DeliveryReceipt, ExecutionRun, ReportDefinition,
    RunStatus, Schedule,
};

use super::{
    decode_cursor, encode_cursor, ArtifactRepo, AuditRepo, DefinitionRepo, ReceiptRepo, RunRepo,
    ScheduleRepo, SchedulePage, StoreError, StoreResult, Stores, MAX_PAGE_LIMIT,
};

/// Build the full in-memory store set.
pub fn memory_stores() -> Stores {
    Stores {
        schedules: Arc::new(MemorySchedules::default()),
        definitions: Arc::new(MemoryDefinitions::default()),
        runs: Arc::new(MemoryRuns::default()),
        artifacts: Arc::new(MemoryArtifacts::default()),
        receipts: Arc::new(MemoryReceipts::default()),
        audit: Arc::new(MemoryAudit::default()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemorySchedules {
    inner: RwLock<HashMap<Uuid, Schedule>>,
}

#[async_trait]
impl ScheduleRepo for MemorySchedules {
    async fn create(&self, schedule: Schedule) -> StoreResult<Schedule> {
        let mut map = self.inner.write();
        map.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Schedule>> {
        let map = self.inner.read();
        Ok(map
            .get(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
        active: Option<bool>,
    ) -> StoreResult<SchedulePage> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let after = cursor.and_then(decode_cursor);

        let map = self.inner.read();
        let mut rows: Vec<&Schedule> = map
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .filter(|s| active.map_or(true, |a| s.active == a))
            .filter(|s| match after {
                // Strictly less than the cursor tuple under DESC ordering.
                Some((at, id)) => s.created_at < at || (s.created_at == at && s.id < id),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        // Over-fetch by one to decide whether a next page exists.
        let mut items: Vec<Schedule> = rows.into_iter().take(limit + 1).cloned().collect();
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items
                .last()
                .map(|s| encode_cursor(s.created_at, s.id))
        } else {
            None
        };
        Ok(SchedulePage { items, next_cursor })
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Schedule>> {
        let map = self.inner.read();
        let mut due: Vec<Schedule> = map
            .values()
            .filter(|s| s.active && s.next_run_at.map_or(false, |next| next <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update(&self, mut schedule: Schedule) -> StoreResult<Schedule> {
        let mut map = self.inner.write();
        if !map.contains_key(&schedule.id) {
            return Err(StoreError::NotFound);
        }
        schedule.updated_at = Utc::now();
        map.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn update_all(&self, schedules: Vec<Schedule>) -> StoreResult<()> {
        let mut map = self.inner.write();
        let now = Utc::now();
        for mut schedule in schedules {
            schedule.updated_at = now;
            map.insert(schedule.id, schedule);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<bool> {
        let mut map = self.inner.write();
        match map.get(&id) {
            Some(s) if s.tenant_id == tenant_id => {
                map.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count(&self, tenant_id: Uuid, active: Option<bool>) -> StoreResult<usize> {
        let map = self.inner.read();
        Ok(map
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .filter(|s| active.map_or(true, |a| s.active == a))
            .count())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryDefinitions {
    inner: RwLock<HashMap<Uuid, ReportDefinition>>,
}

#[async_trait]
impl DefinitionRepo for MemoryDefinitions {
    async fn create(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition> {
        let mut map = self.inner.write();
        map.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ReportDefinition>> {
        let map = self.inner.read();
        Ok(map
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn update(&self, definition: ReportDefinition) -> StoreResult<ReportDefinition> {
        let mut map = self.inner.write();
        if !map.contains_key(&definition.id) {
            return Err(StoreError::NotFound);
        }
        map.insert(definition.id, definition.clone());
        Ok(definition)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryRuns {
    inner: RwLock<HashMap<Uuid, ExecutionRun>>,
}

#[async_trait]
impl RunRepo for MemoryRuns {
    async fn insert(&self, run: ExecutionRun) -> StoreResult<ExecutionRun> {
        let mut map = self.inner.write();
        map.insert(run.id, run.clone());
        Ok(run)
    }

    async fn update(&self, run: ExecutionRun) -> StoreResult<ExecutionRun> {
        let mut map = self.inner.write();
        if !map.contains_key(&run.id) {
            return Err(StoreError::NotFound);
        }
        map.insert(run.id, run.clone());
        Ok(run)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<ExecutionRun>> {
        let map = self.inner.read();
        Ok(map
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn latest_completed(
        &self,
        tenant_id: Uuid,
        report_definition_id: Uuid,
    ) -> StoreResult<Option<ExecutionRun>> {
        let map = self.inner.read();
        Ok(map
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.report_definition_id == report_definition_id
                    && r.status == RunStatus::Completed
            })
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn running_counts(&self) -> StoreResult<Vec<(Uuid, i64)>> {
        let map = self.inner.read();
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for run in map.values() {
            if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                *counts.entry(run.tenant_id).or_insert(0) += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryArtifacts {
    inner: RwLock<HashMap<Uuid, Artifact>>,
}

#[async_trait]
impl ArtifactRepo for MemoryArtifacts {
    async fn insert(&self, artifact: Artifact) -> StoreResult<Artifact> {
        let mut map = self.inner.write();
        if map
            .values()
            .any(|a| a.execution_run_id == artifact.execution_run_id)
        {
            return Err(StoreError::Conflict(format!(
                "artifact already exists for run {}",
                artifact.execution_run_id
            )));
        }
        map.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn find(&self, id: Uuid, tenant_id: Uuid) -> StoreResult<Option<Artifact>> {
        let map = self.inner.read();
        Ok(map
            .get(&id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_run(
        &self,
        execution_run_id: Uuid,
        tenant_id: Uuid,
    ) -> StoreResult<Option<Artifact>> {
        let map = self.inner.read();
        Ok(map
            .values()
            .find(|a| a.execution_run_id == execution_run_id && a.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Artifact>> {
        let map = self.inner.read();
        let mut expired: Vec<Artifact> = map
            .values()
            .filter(|a| a.created_at < cutoff)
            .cloned()
            .collect();
        expired.sort_by_key(|a| a.created_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut map = self.inner.write();
        Ok(map.remove(&id).is_some())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery receipts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryReceipts {
    inner: RwLock<Vec<DeliveryReceipt>>,
}

#[async_trait]
impl ReceiptRepo for MemoryReceipts {
    async fn insert(&self, receipt: DeliveryReceipt) -> StoreResult<DeliveryReceipt> {
        let mut rows = self.inner.write();
        rows.push(receipt.clone());
        Ok(receipt)
    }

    async fn list_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let rows = self.inner.read();
        Ok(rows
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.artifact_id == artifact_id)
            .cloned()
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryAudit {
    inner: RwLock<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditRepo for MemoryAudit {
    async fn insert(&self, event: AuditEvent) -> StoreResult<AuditEvent> {
        let mut rows = self.inner.write();
        rows.push(event.clone());
        Ok(event)
    }

    async fn trail_for_artifact(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = self.inner.read();
        let artifact_id = artifact_id.to_string();
        let mut events: Vec<AuditEvent> = rows
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.resource_type == "artifact"
                    && e.resource_id == artifact_id
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn for_user(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        event_types: Option<&[AuditEventType]>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = self.inner.read();
        let mut events: Vec<AuditEvent> = rows
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| e.event_data.get("user_id").and_then(|v| v.as_str()) == Some(user_id))
            .filter(|e| event_types.map_or(true, |types| types.contains(&e.event_type)))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEvent>> {
        let rows = self.inner.read();
        let mut events: Vec<AuditEvent> = rows
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.created_at >= start && e.created_at <= end)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}
