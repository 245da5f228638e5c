use std::sync::Arc;

use courier_domain::config::Config;

use crate::audit::AuditService;
use crate::blob::{BlobStore, UrlSigner};
use crate::burst::BurstProtection;
use crate::cache::ReportCache;
use crate::email::EmailService;
use crate::kv::Kv;
use crate::pipeline::ExecutionPipeline;
use crate::queue::MemoryQueue;
use crate::retention::RetentionSweeper;
use crate::scheduler::SchedulerLoop;
use crate::service::{ReportDefinitionService, ScheduleService};
use crate::storage::Stores;

/// Shared application state passed to all API handlers and background
/// tasks. Constructed once in `bootstrap::build_app_state` and cloned
/// cheaply (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Persistence ───────────────────────────────────────────────────
    pub stores: Stores,
    pub kv: Arc<dyn Kv>,
    pub blob: Arc<dyn BlobStore>,
    pub signer: Arc<UrlSigner>,

    // ── Domain services ───────────────────────────────────────────────
    pub schedules: Arc<ScheduleService>,
    pub definitions: Arc<ReportDefinitionService>,
    pub audit: Arc<AuditService>,

    // ── Execution ─────────────────────────────────────────────────────
    pub cache: Arc<ReportCache>,
    pub burst: Arc<BurstProtection>,
    /// In-process broker; external brokers bind behind `TaskQueue` and a
    /// separate consumer.
    pub queue: Arc<MemoryQueue>,
    pub email: Arc<EmailService>,
    pub pipeline: Arc<ExecutionPipeline>,
    pub scheduler: Arc<SchedulerLoop>,
    pub sweeper: Arc<RetentionSweeper>,
}
