//! Scheduler loop — the single logical ticker across all replicas.
//!
//! Every tick, at most one replica wins the distributed scan lock and
//! processes due schedules in `next_run_at ASC` order: burst-protection
//! admission, descriptor enqueue, timestamp advance. Refused or
//! failed-to-enqueue schedules keep their timestamps and stay due for the
//! next scan. Missed fires are never backfilled: one enqueue per scan, and
//! `next_run_at` jumps to the next future fire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::burst::{Admission, BurstProtection};
use crate::cron;
use crate::kv::Kv;
use crate::queue::{QueueName, TaskDescriptor, TaskQueue, DEFAULT_PRIORITY};
use crate::storage::{ScheduleRepo, DEFAULT_DUE_LIMIT};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(30);
pub const SCAN_LOCK_TTL: Duration = Duration::from_secs(60);

const SCAN_LOCK_KEY: &str = "scheduler:scan_lock";

/// Outcome of one scan, tagged with the scan identity for observability.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_id: Uuid,
    /// False when another replica held the lock (or the lock store failed).
    pub acquired: bool,
    pub due: usize,
    pub enqueued: usize,
    /// Left due by burst protection or an enqueue failure.
    pub deferred: usize,
    /// Deactivated because the cron stopped resolving.
    pub deactivated: usize,
}

impl ScanReport {
    fn skipped(scan_id: Uuid) -> Self {
        Self {
            scan_id,
            acquired: false,
            due: 0,
            enqueued: 0,
            deferred: 0,
            deactivated: 0,
        }
    }
}

pub struct SchedulerLoop {
    schedules: Arc<dyn ScheduleRepo>,
    kv: Arc<dyn Kv>,
    burst: Arc<BurstProtection>,
    queue: Arc<dyn TaskQueue>,
}

impl SchedulerLoop {
    pub fn new(
        schedules: Arc<dyn ScheduleRepo>,
        kv: Arc<dyn Kv>,
        burst: Arc<BurstProtection>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            schedules,
            kv,
            burst,
            queue,
        }
    }

    /// One scan at the given instant. The periodic loop passes the wall
    /// clock; tests drive time explicitly.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> ScanReport {
        let scan_id = Uuid::new_v4();

        // Mutual exclusion: set-if-absent with TTL. Losing the race (or a
        // lock-store outage) skips the scan; the next tick retries.
        let acquired = match self
            .kv
            .set_if_absent(
                SCAN_LOCK_KEY,
                scan_id.to_string().into_bytes(),
                SCAN_LOCK_TTL,
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "scan lock unavailable");
                return ScanReport::skipped(scan_id);
            }
        };
        if !acquired {
            tracing::debug!(scan_id = %scan_id, "another replica is scanning, skipping");
            return ScanReport::skipped(scan_id);
        }

        let report = self.scan_locked(scan_id, now).await;

        if let Err(e) = self.kv.remove(SCAN_LOCK_KEY).await {
            tracing::warn!(scan_id = %scan_id, error = %e, "failed to release scan lock");
        }
        report
    }

    async fn scan_locked(&self, scan_id: Uuid, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport {
            scan_id,
            acquired: true,
            due: 0,
            enqueued: 0,
            deferred: 0,
            deactivated: 0,
        };

        let due = match self.schedules.find_due(now, DEFAULT_DUE_LIMIT).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "due-schedule query failed");
                return report;
            }
        };
        report.due = due.len();
        if due.is_empty() {
            tracing::debug!(scan_id = %scan_id, "no due schedules");
            return report;
        }
        tracing::info!(scan_id = %scan_id, due = due.len(), "schedule scan started");

        // Grants made earlier in this scan count toward the caps even
        // though their workers have not reached `enter` yet.
        let mut granted_by_tenant: std::collections::HashMap<Uuid, i64> =
            std::collections::HashMap::new();
        let mut granted_global: i64 = 0;

        let mut updates = Vec::with_capacity(due.len());
        for mut schedule in due {
            let pending_tenant = granted_by_tenant
                .get(&schedule.tenant_id)
                .copied()
                .unwrap_or(0);
            match self
                .burst
                .admit_with_pending(schedule.tenant_id, None, pending_tenant, granted_global)
                .await
            {
                Admission::Granted => {}
                Admission::Refused(reason) => {
                    // Timestamps untouched: the schedule stays due and is
                    // retried next tick.
                    tracing::warn!(
                        scan_id = %scan_id,
                        schedule_id = %schedule.id,
                        tenant_id = %schedule.tenant_id,
                        reason = %reason,
                        "admission refused, schedule stays due"
                    );
                    report.deferred += 1;
                    continue;
                }
            }

            let descriptor = TaskDescriptor {
                task_id: Uuid::new_v4(),
                tenant_id: schedule.tenant_id,
                schedule_id: Some(schedule.id),
                report_definition_id: schedule.report_definition_id,
                email_delivery_config: schedule.email_delivery_config.clone(),
                enqueued_at: now,
            };
            let task_id = descriptor.task_id;
            if let Err(e) = self
                .queue
                .publish(QueueName::Reports, DEFAULT_PRIORITY, descriptor)
                .await
            {
                tracing::error!(
                    scan_id = %scan_id,
                    schedule_id = %schedule.id,
                    error = %e,
                    "enqueue failed, schedule stays due"
                );
                report.deferred += 1;
                continue;
            }
            tracing::info!(
                scan_id = %scan_id,
                schedule_id = %schedule.id,
                task_id = %task_id,
                "enqueued report task"
            );
            report.enqueued += 1;
            *granted_by_tenant.entry(schedule.tenant_id).or_insert(0) += 1;
            granted_global += 1;

            schedule.last_run_at = Some(now);
            match cron::next_fire(&schedule.cron_expression, &schedule.timezone, now) {
                Ok(next) => schedule.next_run_at = Some(next),
                Err(e) => {
                    // A previously valid cron no longer resolves (e.g. a tz
                    // table update). Deactivate rather than rescan forever.
                    tracing::error!(
                        scan_id = %scan_id,
                        schedule_id = %schedule.id,
                        error = %e,
                        "next-run computation failed, deactivating schedule"
                    );
                    schedule.active = false;
                    schedule.last_error = Some(e.to_string());
                    report.deactivated += 1;
                }
            }
            updates.push(schedule);
        }

        if !updates.is_empty() {
            if let Err(e) = self.schedules.update_all(updates).await {
                // The enqueues already happened; duplicates on the next scan
                // are covered by at-least-once semantics downstream.
                tracing::error!(scan_id = %scan_id, error = %e, "schedule update commit failed");
            }
        }

        tracing::info!(
            scan_id = %scan_id,
            enqueued = report.enqueued,
            deferred = report.deferred,
            deactivated = report.deactivated,
            "schedule scan completed"
        );
        report
    }
}
