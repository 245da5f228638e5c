//! Audit log — append-only record of user-visible actions on artifacts,
//! with read APIs for trails, user activity, and compliance reporting.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use courier_domain::model::{AuditEvent, AuditEventType};

use crate::storage::{AuditRepo, StoreResult};

/// Trail and activity queries return at most this many events.
pub const DEFAULT_TRAIL_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub tenant_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_events: usize,
    pub by_type: HashMap<String, usize>,
    pub unique_users: usize,
    pub unique_artifacts: usize,
    pub events: Vec<AuditEvent>,
}

pub struct AuditService {
    audit: Arc<dyn AuditRepo>,
}

impl AuditService {
    pub fn new(audit: Arc<dyn AuditRepo>) -> Self {
        Self { audit }
    }

    async fn record(
        &self,
        tenant_id: Uuid,
        event_type: AuditEventType,
        artifact_id: Uuid,
        event_data: serde_json::Value,
    ) -> StoreResult<AuditEvent> {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            tenant_id,
            event_type,
            resource_type: "artifact".to_string(),
            resource_id: artifact_id.to_string(),
            event_data,
            created_at: Utc::now(),
        };
        let event = self.audit.insert(event).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            artifact_id = %artifact_id,
            event_type = event.event_type.as_str(),
            "audit event recorded"
        );
        Ok(event)
    }

    /// A signed URL was accessed.
    pub async fn track_report_viewed(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        user_id: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> StoreResult<AuditEvent> {
        self.record(
            tenant_id,
            AuditEventType::ReportViewed,
            artifact_id,
            serde_json::json!({
                "user_id": user_id,
                "ip_address": ip_address,
                "user_agent": user_agent,
            }),
        )
        .await
    }

    pub async fn track_report_downloaded(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        user_id: Option<&str>,
        download_method: &str,
    ) -> StoreResult<AuditEvent> {
        self.record(
            tenant_id,
            AuditEventType::ReportDownloaded,
            artifact_id,
            serde_json::json!({
                "user_id": user_id,
                "download_method": download_method,
            }),
        )
        .await
    }

    pub async fn track_report_shared(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
        shared_by_user_id: &str,
        shared_with: &[String],
        share_method: &str,
    ) -> StoreResult<AuditEvent> {
        self.record(
            tenant_id,
            AuditEventType::ReportShared,
            artifact_id,
            serde_json::json!({
                "user_id": shared_by_user_id,
                "shared_with": shared_with,
                "share_method": share_method,
                "recipient_count": shared_with.len(),
            }),
        )
        .await
    }

    /// Latest events for one artifact, newest first.
    pub async fn artifact_trail(
        &self,
        tenant_id: Uuid,
        artifact_id: Uuid,
    ) -> StoreResult<Vec<AuditEvent>> {
        self.audit
            .trail_for_artifact(tenant_id, artifact_id, DEFAULT_TRAIL_LIMIT)
            .await
    }

    pub async fn user_activity(
        &self,
        tenant_id: Uuid,
        user_id: &str,
        event_types: Option<&[AuditEventType]>,
    ) -> StoreResult<Vec<AuditEvent>> {
        self.audit
            .for_user(tenant_id, user_id, event_types, DEFAULT_TRAIL_LIMIT)
            .await
    }

    /// Aggregate all activity in a date range.
    pub async fn compliance_report(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<ComplianceReport> {
        let events = self.audit.between(tenant_id, start, end).await?;

        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut users = std::collections::HashSet::new();
        let mut artifacts = std::collections::HashSet::new();
        for event in &events {
            *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
            if let Some(user) = event.event_data.get("user_id").and_then(|v| v.as_str()) {
                users.insert(user.to_string());
            }
            artifacts.insert(event.resource_id.clone());
        }

        Ok(ComplianceReport {
            tenant_id,
            start,
            end,
            total_events: events.len(),
            by_type,
            unique_users: users.len(),
            unique_artifacts: artifacts.len(),
            events,
        })
    }
}
