//! Burst protection — distributed in-flight execution counters with a
//! per-tenant and a global cap.
//!
//! `admit` fails open when the counter backend is unavailable: a transient
//! KV outage must not stop report generation. `enter`/`exit` bracket each
//! pipeline execution; a crashed worker leaves a stale increment that the
//! defensive TTL and the periodic `sync` against the database repair.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::kv::Kv;
use crate::storage::RunRepo;

pub const DEFAULT_MAX_CONCURRENT_PER_TENANT: i64 = 5;
pub const DEFAULT_MAX_CONCURRENT_GLOBAL: i64 = 50;

const COUNTER_PREFIX: &str = "concurrent_executions:";

/// Bounds stale increments from workers that died without `exit`.
const COUNTER_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug)]
pub struct BurstCaps {
    pub per_tenant: i64,
    pub global: i64,
}

impl Default for BurstCaps {
    fn default() -> Self {
        Self {
            per_tenant: DEFAULT_MAX_CONCURRENT_PER_TENANT,
            global: DEFAULT_MAX_CONCURRENT_GLOBAL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Refused(String),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CurrentCounts {
    pub tenant_running: i64,
    pub global_running: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncReport {
    pub tenants_synced: usize,
    pub total_running: i64,
}

pub struct BurstProtection {
    kv: Arc<dyn Kv>,
    caps: BurstCaps,
}

fn tenant_key(tenant_id: Uuid) -> String {
    format!("{COUNTER_PREFIX}tenant:{tenant_id}")
}

fn global_key() -> String {
    format!("{COUNTER_PREFIX}global")
}

impl BurstProtection {
    pub fn new(kv: Arc<dyn Kv>, caps: BurstCaps) -> Self {
        Self { kv, caps }
    }

    async fn read_counter(&self, key: &str) -> Result<i64, crate::kv::KvError> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Check whether a new execution may start. Caps may be overridden per
    /// call; backend failures admit.
    pub async fn admit(&self, tenant_id: Uuid, caps: Option<BurstCaps>) -> Admission {
        self.admit_with_pending(tenant_id, caps, 0, 0).await
    }

    /// Admission check that also counts grants the caller has already made
    /// but whose executions have not yet reached `enter` — the scheduler
    /// passes its per-scan grant tally so one scan cannot overshoot the
    /// caps.
    pub async fn admit_with_pending(
        &self,
        tenant_id: Uuid,
        caps: Option<BurstCaps>,
        pending_tenant: i64,
        pending_global: i64,
    ) -> Admission {
        let caps = caps.unwrap_or(self.caps);

        let tenant_running = match self.read_counter(&tenant_key(tenant_id)).await {
            Ok(n) => n + pending_tenant,
            Err(e) => {
                tracing::error!(error = %e, "burst-protection check failed, admitting");
                return Admission::Granted;
            }
        };
        if tenant_running >= caps.per_tenant {
            let reason = format!(
                "tenant {tenant_id} has reached max concurrent executions \
                 ({tenant_running}/{})",
                caps.per_tenant
            );
            tracing::warn!(tenant_id = %tenant_id, "{reason}");
            return Admission::Refused(reason);
        }

        let global_running = match self.read_counter(&global_key()).await {
            Ok(n) => n + pending_global,
            Err(e) => {
                tracing::error!(error = %e, "burst-protection check failed, admitting");
                return Admission::Granted;
            }
        };
        if global_running >= caps.global {
            let reason = format!(
                "global max concurrent executions reached ({global_running}/{})",
                caps.global
            );
            tracing::warn!("{reason}");
            return Admission::Refused(reason);
        }

        Admission::Granted
    }

    /// Increment both counters at execution start.
    pub async fn enter(&self, tenant_id: Uuid) {
        let tenant = tenant_key(tenant_id);
        let global = global_key();
        let result = async {
            self.kv.incr(&tenant).await?;
            self.kv.incr(&global).await?;
            self.kv.expire(&tenant, COUNTER_TTL).await?;
            self.kv.expire(&global, COUNTER_TTL).await?;
            Ok::<_, crate::kv::KvError>(())
        };
        match result.await {
            Ok(()) => tracing::debug!(tenant_id = %tenant_id, "incremented execution count"),
            Err(e) => tracing::error!(error = %e, "failed to increment execution count"),
        }
    }

    /// Decrement both counters at execution end, clamped at zero.
    pub async fn exit(&self, tenant_id: Uuid) {
        let result = async {
            self.kv.decr_clamped(&tenant_key(tenant_id)).await?;
            self.kv.decr_clamped(&global_key()).await?;
            Ok::<_, crate::kv::KvError>(())
        };
        match result.await {
            Ok(()) => tracing::debug!(tenant_id = %tenant_id, "decremented execution count"),
            Err(e) => tracing::error!(error = %e, "failed to decrement execution count"),
        }
    }

    /// Overwrite the counters from database ground truth (pending + running
    /// runs grouped by tenant). Run on a slow timer to repair drift.
    pub async fn sync(&self, runs: &dyn RunRepo) -> SyncReport {
        let counts = match runs.running_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::error!(error = %e, "failed to read running counts for sync");
                return SyncReport::default();
            }
        };

        let mut total = 0;
        for (tenant_id, count) in &counts {
            total += count;
            if let Err(e) = self
                .kv
                .set(
                    &tenant_key(*tenant_id),
                    count.to_string().into_bytes(),
                    Some(COUNTER_TTL),
                )
                .await
            {
                tracing::error!(error = %e, tenant_id = %tenant_id, "counter sync write failed");
            }
        }
        if let Err(e) = self
            .kv
            .set(&global_key(), total.to_string().into_bytes(), Some(COUNTER_TTL))
            .await
        {
            tracing::error!(error = %e, "global counter sync write failed");
        }

        tracing::info!(
            tenants = counts.len(),
            total_running = total,
            "synced burst-protection counters"
        );
        SyncReport {
            tenants_synced: counts.len(),
            total_running: total,
        }
    }

    pub async fn current_counts(&self, tenant_id: Option<Uuid>) -> CurrentCounts {
        let global_running = self.read_counter(&global_key()).await.unwrap_or(0);
        let tenant_running = match tenant_id {
            Some(id) => self.read_counter(&tenant_key(id)).await.unwrap_or(0),
            None => 0,
        };
        CurrentCounts {
            tenant_running,
            global_running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvError, MemoryKv};
    use async_trait::async_trait;

    fn burst() -> BurstProtection {
        BurstProtection::new(Arc::new(MemoryKv::new()), BurstCaps::default())
    }

    #[tokio::test]
    async fn admits_under_cap_and_refuses_at_cap() {
        let burst = burst();
        let tenant = Uuid::new_v4();
        for _ in 0..DEFAULT_MAX_CONCURRENT_PER_TENANT {
            assert!(burst.admit(tenant, None).await.is_granted());
            burst.enter(tenant).await;
        }
        match burst.admit(tenant, None).await {
            Admission::Refused(reason) => assert!(reason.contains("max concurrent")),
            Admission::Granted => panic!("expected refusal at per-tenant cap"),
        }
    }

    #[tokio::test]
    async fn exit_frees_a_slot() {
        let burst = burst();
        let tenant = Uuid::new_v4();
        for _ in 0..DEFAULT_MAX_CONCURRENT_PER_TENANT {
            burst.enter(tenant).await;
        }
        assert!(!burst.admit(tenant, None).await.is_granted());
        burst.exit(tenant).await;
        assert!(burst.admit(tenant, None).await.is_granted());
    }

    #[tokio::test]
    async fn global_cap_spans_tenants() {
        let burst = BurstProtection::new(
            Arc::new(MemoryKv::new()),
            BurstCaps {
                per_tenant: 100,
                global: 3,
            },
        );
        for _ in 0..3 {
            burst.enter(Uuid::new_v4()).await;
        }
        match burst.admit(Uuid::new_v4(), None).await {
            Admission::Refused(reason) => assert!(reason.contains("global")),
            Admission::Granted => panic!("expected refusal at global cap"),
        }
    }

    #[tokio::test]
    async fn pending_grants_count_toward_caps() {
        let burst = burst();
        let tenant = Uuid::new_v4();
        // Counter at zero, but four grants already made this scan.
        assert!(burst
            .admit_with_pending(tenant, None, 4, 4)
            .await
            .is_granted());
        assert!(!burst
            .admit_with_pending(tenant, None, 5, 5)
            .await
            .is_granted());
    }

    #[tokio::test]
    async fn per_call_cap_override() {
        let burst = burst();
        let tenant = Uuid::new_v4();
        burst.enter(tenant).await;
        let tight = BurstCaps {
            per_tenant: 1,
            global: 50,
        };
        assert!(!burst.admit(tenant, Some(tight)).await.is_granted());
        assert!(burst.admit(tenant, None).await.is_granted());
    }

    struct DownKv;

    #[async_trait]
    impl Kv for DownKv {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<std::time::Duration>) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn set_if_absent(&self, _: &str, _: Vec<u8>, _: std::time::Duration) -> Result<bool, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn remove(&self, _: &str) -> Result<bool, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn incr(&self, _: &str) -> Result<i64, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn decr_clamped(&self, _: &str) -> Result<i64, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: std::time::Duration) -> Result<bool, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn keys_with_prefix(&self, _: &str) -> Result<Vec<String>, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn admit_fails_open_when_backend_is_down() {
        let burst = BurstProtection::new(Arc::new(DownKv), BurstCaps::default());
        assert!(burst.admit(Uuid::new_v4(), None).await.is_granted());
    }

    #[tokio::test]
    async fn sync_overwrites_counters_from_ground_truth() {
        use crate::storage::memory::MemoryRuns;
        use chrono::Utc;
        use courier_domain::model::{ExecutionRun, RunMetadata, RunStatus};

        let kv = Arc::new(MemoryKv::new());
        let burst = BurstProtection::new(kv.clone(), BurstCaps::default());
        let tenant = Uuid::new_v4();

        // Drift: three stale increments, but only one run actually in flight.
        for _ in 0..3 {
            burst.enter(tenant).await;
        }
        let runs = MemoryRuns::default();
        runs.insert(ExecutionRun {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            schedule_id: None,
            report_definition_id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            metadata: RunMetadata::default(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let report = burst.sync(&runs).await;
        assert_eq!(report.tenants_synced, 1);
        assert_eq!(report.total_running, 1);
        let counts = burst.current_counts(Some(tenant)).await;
        assert_eq!(counts.tenant_running, 1);
        assert_eq!(counts.global_running, 1);
    }
}
