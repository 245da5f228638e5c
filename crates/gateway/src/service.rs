//! Write-side business rules for schedules and report definitions.
//!
//! All validation lives here: tenant quotas, cron/timezone checks, and the
//! next-run recomputation rules. Repositories persist what this layer hands
//! them; the HTTP layer only translates errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use courier_domain::model::{EmailDeliveryConfig, ReportDefinition, Schedule, TenantTier};
use courier_domain::{ServiceError, ServiceResult};

use crate::cache::ReportCache;
use crate::cron::{self, CronError};
use crate::storage::{DefinitionRepo, SchedulePage, ScheduleRepo};

fn cron_err(err: CronError) -> ServiceError {
    match err {
        CronError::InvalidCron(msg) => ServiceError::InvalidCron(msg),
        CronError::InvalidTimezone(tz) => ServiceError::InvalidTimezone(tz),
    }
}

pub struct CreateScheduleInput {
    pub tenant_id: Uuid,
    pub tenant_tier: TenantTier,
    pub report_definition_id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub email_delivery_config: Option<EmailDeliveryConfig>,
    pub created_by: Option<String>,
}

#[derive(Default)]
pub struct UpdateScheduleInput {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub email_delivery_config: Option<EmailDeliveryConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CronPreview {
    pub description: String,
    pub next_runs: Vec<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScheduleService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScheduleService {
    schedules: Arc<dyn ScheduleRepo>,
}

impl ScheduleService {
    pub fn new(schedules: Arc<dyn ScheduleRepo>) -> Self {
        Self { schedules }
    }

    /// Create a schedule: quota, then cron, then timezone/next-run — the
    /// first failure wins and nothing is persisted.
    pub async fn create(&self, input: CreateScheduleInput) -> ServiceResult<Schedule> {
        let quota = input.tenant_tier.schedule_quota();
        let active_count = self.schedules.count(input.tenant_id, Some(true)).await?;
        if active_count >= quota {
            return Err(ServiceError::QuotaExceeded {
                limit: quota,
                tier: input.tenant_tier.as_str().to_string(),
            });
        }

        cron::validate_cron(&input.cron_expression).map_err(cron_err)?;
        let now = Utc::now();
        let next_run_at =
            cron::next_fire(&input.cron_expression, &input.timezone, now).map_err(cron_err)?;

        let schedule = Schedule {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            report_definition_id: input.report_definition_id,
            name: input.name,
            cron_expression: input.cron_expression,
            timezone: input.timezone,
            active: true,
            next_run_at: Some(next_run_at),
            last_run_at: None,
            email_delivery_config: input.email_delivery_config,
            last_error: None,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
        };
        let created = self.schedules.create(schedule).await?;
        tracing::info!(
            schedule_id = %created.id,
            tenant_id = %created.tenant_id,
            next_run_at = ?created.next_run_at,
            "schedule created"
        );
        Ok(created)
    }

    pub async fn get(&self, id: Uuid, tenant_id: Uuid) -> ServiceResult<Schedule> {
        self.schedules
            .find(id, tenant_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    pub async fn list(
        &self,
        tenant_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
        active: Option<bool>,
    ) -> ServiceResult<SchedulePage> {
        Ok(self.schedules.list(tenant_id, cursor, limit, active).await?)
    }

    /// Apply the provided fields. Changing the cron or the timezone
    /// recomputes `next_run_at` from the current wall clock.
    pub async fn update(
        &self,
        id: Uuid,
        tenant_id: Uuid,
        input: UpdateScheduleInput,
    ) -> ServiceResult<Schedule> {
        let mut schedule = self.get(id, tenant_id).await?;

        if let Some(name) = input.name {
            schedule.name = name;
        }
        let mut recompute = false;
        if let Some(cron_expression) = input.cron_expression {
            cron::validate_cron(&cron_expression).map_err(cron_err)?;
            schedule.cron_expression = cron_expression;
            recompute = true;
        }
        if let Some(timezone) = input.timezone {
            schedule.timezone = timezone;
            recompute = true;
        }
        if recompute {
            let next =
                cron::next_fire(&schedule.cron_expression, &schedule.timezone, Utc::now())
                    .map_err(cron_err)?;
            schedule.next_run_at = Some(next);
        }
        if let Some(config) = input.email_delivery_config {
            schedule.email_delivery_config = Some(config);
        }

        Ok(self.schedules.update(schedule).await?)
    }

    /// Deactivate. `next_run_at` is left in place; an inactive schedule is
    /// never picked up by the due scan.
    pub async fn pause(&self, id: Uuid, tenant_id: Uuid) -> ServiceResult<Schedule> {
        let mut schedule = self.get(id, tenant_id).await?;
        schedule.active = false;
        Ok(self.schedules.update(schedule).await?)
    }

    /// Reactivate and recompute `next_run_at` from now, so an active
    /// schedule always fires in the future.
    pub async fn resume(&self, id: Uuid, tenant_id: Uuid) -> ServiceResult<Schedule> {
        let mut schedule = self.get(id, tenant_id).await?;
        schedule.active = true;
        let next = cron::next_fire(&schedule.cron_expression, &schedule.timezone, Utc::now())
            .map_err(cron_err)?;
        schedule.next_run_at = Some(next);
        schedule.last_error = None;
        Ok(self.schedules.update(schedule).await?)
    }

    /// Returns whether the schedule existed.
    pub async fn delete(&self, id: Uuid, tenant_id: Uuid) -> ServiceResult<bool> {
        Ok(self.schedules.delete(id, tenant_id).await?)
    }

    /// Validate an expression and preview its next fires.
    pub fn preview(
        &self,
        cron_expression: &str,
        timezone: &str,
        count: usize,
    ) -> ServiceResult<CronPreview> {
        let description = cron::describe(cron_expression).map_err(cron_err)?;
        let next_runs =
            cron::next_fires(cron_expression, timezone, Utc::now(), count).map_err(cron_err)?;
        Ok(CronPreview {
            description,
            next_runs,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ReportDefinitionService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReportDefinitionService {
    definitions: Arc<dyn DefinitionRepo>,
    cache: Arc<ReportCache>,
}

impl ReportDefinitionService {
    pub fn new(definitions: Arc<dyn DefinitionRepo>, cache: Arc<ReportCache>) -> Self {
        Self { definitions, cache }
    }

    pub async fn create(&self, definition: ReportDefinition) -> ServiceResult<ReportDefinition> {
        Ok(self.definitions.create(definition).await?)
    }

    pub async fn get(&self, id: Uuid, tenant_id: Uuid) -> ServiceResult<ReportDefinition> {
        self.definitions
            .find(id, tenant_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Persist the updated definition and invalidate every cached artifact
    /// generated from the previous version.
    pub async fn update(&self, definition: ReportDefinition) -> ServiceResult<ReportDefinition> {
        let updated = self.definitions.update(definition).await?;
        let invalidated = self.cache.invalidate_all(updated.id).await;
        tracing::info!(
            report_definition_id = %updated.id,
            invalidated,
            "report definition updated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::storage::memory::{memory_stores, MemorySchedules};
    use courier_domain::model::OutputFormat;

    fn service() -> ScheduleService {
        ScheduleService::new(Arc::new(MemorySchedules::default()))
    }

    fn create_input(tenant: Uuid, tier: TenantTier) -> CreateScheduleInput {
        CreateScheduleInput {
            tenant_id: tenant,
            tenant_tier: tier,
            report_definition_id: Uuid::new_v4(),
            name: "daily sales".into(),
            cron_expression: "0 9 * * *".into(),
            timezone: "America/New_York".into(),
            email_delivery_config: None,
            created_by: Some("user-1".into()),
        }
    }

    #[tokio::test]
    async fn create_computes_future_next_run() {
        let service = service();
        let before = Utc::now();
        let schedule = service
            .create(create_input(Uuid::new_v4(), TenantTier::Standard))
            .await
            .unwrap();
        assert!(schedule.active);
        assert!(schedule.next_run_at.unwrap() > before);
        assert!(schedule.last_run_at.is_none());
    }

    #[tokio::test]
    async fn create_rejects_invalid_cron_and_timezone() {
        let service = service();
        let tenant = Uuid::new_v4();

        let mut bad_cron = create_input(tenant, TenantTier::Standard);
        bad_cron.cron_expression = "61 * * * *".into();
        assert!(matches!(
            service.create(bad_cron).await,
            Err(ServiceError::InvalidCron(_))
        ));

        let mut bad_tz = create_input(tenant, TenantTier::Standard);
        bad_tz.timezone = "Mars/Olympus".into();
        assert!(matches!(
            service.create(bad_tz).await,
            Err(ServiceError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn quota_blocks_creation_without_insert() {
        let repo = Arc::new(MemorySchedules::default());
        let service = ScheduleService::new(repo.clone());
        let tenant = Uuid::new_v4();
        for _ in 0..10 {
            service
                .create(create_input(tenant, TenantTier::Standard))
                .await
                .unwrap();
        }
        let err = service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded { limit: 10, .. }));
        // No row was written by the rejected create.
        assert_eq!(repo.count(tenant, None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn paused_schedules_do_not_count_against_quota() {
        let service = service();
        let tenant = Uuid::new_v4();
        for _ in 0..10 {
            let s = service
                .create(create_input(tenant, TenantTier::Standard))
                .await
                .unwrap();
            service.pause(s.id, tenant).await.unwrap();
        }
        assert!(service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn premium_quota_is_fifty() {
        let service = service();
        let tenant = Uuid::new_v4();
        for _ in 0..50 {
            service
                .create(create_input(tenant, TenantTier::Premium))
                .await
                .unwrap();
        }
        assert!(matches!(
            service.create(create_input(tenant, TenantTier::Premium)).await,
            Err(ServiceError::QuotaExceeded { limit: 50, .. })
        ));
    }

    #[tokio::test]
    async fn update_recomputes_next_run_only_on_cron_or_tz_change() {
        let service = service();
        let tenant = Uuid::new_v4();
        let schedule = service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .unwrap();
        let original_next = schedule.next_run_at;

        // Name-only update keeps next_run_at.
        let renamed = service
            .update(
                schedule.id,
                tenant,
                UpdateScheduleInput {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.next_run_at, original_next);
        assert_eq!(renamed.name, "renamed");

        // Cron change recomputes.
        let rescheduled = service
            .update(
                schedule.id,
                tenant,
                UpdateScheduleInput {
                    cron_expression: Some("*/15 * * * *".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(rescheduled.next_run_at, original_next);
        assert!(rescheduled.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn update_rejects_bad_cron_without_persisting() {
        let service = service();
        let tenant = Uuid::new_v4();
        let schedule = service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .unwrap();
        let err = service
            .update(
                schedule.id,
                tenant,
                UpdateScheduleInput {
                    cron_expression: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCron(_)));
        let unchanged = service.get(schedule.id, tenant).await.unwrap();
        assert_eq!(unchanged.cron_expression, "0 9 * * *");
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let service = service();
        assert!(matches!(
            service
                .update(Uuid::new_v4(), Uuid::new_v4(), UpdateScheduleInput::default())
                .await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let service = service();
        let tenant = Uuid::new_v4();
        let schedule = service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .unwrap();

        let paused = service.pause(schedule.id, tenant).await.unwrap();
        assert!(!paused.active);

        let before_resume = Utc::now();
        let resumed = service.resume(schedule.id, tenant).await.unwrap();
        assert!(resumed.active);
        // P1: next_run_at strictly after the mutation instant.
        assert!(resumed.next_run_at.unwrap() > before_resume);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let service = service();
        let tenant = Uuid::new_v4();
        let schedule = service
            .create(create_input(tenant, TenantTier::Standard))
            .await
            .unwrap();
        assert!(service.delete(schedule.id, tenant).await.unwrap());
        assert!(!service.delete(schedule.id, tenant).await.unwrap());
    }

    #[tokio::test]
    async fn preview_describes_and_lists_fires() {
        let service = service();
        let preview = service.preview("0 9 * * *", "UTC", 5).unwrap();
        assert_eq!(preview.description, "At 09:00, every day");
        assert_eq!(preview.next_runs.len(), 5);
        assert!(preview.next_runs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn definition_update_invalidates_cache() {
        let stores = memory_stores();
        let cache = Arc::new(ReportCache::new(Arc::new(MemoryKv::new())));
        let service = ReportDefinitionService::new(stores.definitions.clone(), cache.clone());

        let tenant = Uuid::new_v4();
        let mut definition = ReportDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "sales".into(),
            query_spec: serde_json::json!({"rows": []}),
            template_ref: "templates/default".into(),
            output_format: OutputFormat::Pdf,
            cache_ttl_seconds: 3600,
            created_at: Utc::now(),
        };
        service.create(definition.clone()).await.unwrap();
        cache
            .put(definition.id, &definition.query_spec, None, vec![1, 2], 3600, None, None)
            .await;
        assert!(cache.get(definition.id, &definition.query_spec, None).await.is_some());

        definition.name = "sales v2".into();
        service.update(definition.clone()).await.unwrap();
        assert!(
            cache.get(definition.id, &definition.query_spec, None).await.is_none(),
            "definition update must invalidate cached artifacts"
        );
    }
}
