//! AppState construction and background-task spawning shared by the
//! `serve`, `worker`, and `sweep` commands.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::task::JoinHandle;

use courier_domain::config::{Config, ConfigSeverity};

use crate::audit::AuditService;
use crate::blob::{BlobStore, FsBlobStore, UrlSigner};
use crate::burst::{BurstCaps, BurstProtection};
use crate::cache::ReportCache;
use crate::email::EmailService;
use crate::kv::{Kv, MemoryKv};
use crate::pipeline::{ExecutionPipeline, PipelineConfig};
use crate::queue::{MemoryQueue, QueueName, TaskQueue};
use crate::render::{InlineDataSource, TableTemplateRenderer, TextPdfRenderer};
use crate::retention::RetentionSweeper;
use crate::scheduler::{SchedulerLoop, SCAN_INTERVAL};
use crate::service::{ReportDefinitionService, ScheduleService};
use crate::state::AppState;
use crate::storage::memory::memory_stores;
use crate::storage::postgres::PgStore;

/// Counter reconciliation cadence.
const BURST_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Retention sweep cadence.
const RETENTION_INTERVAL: std::time::Duration = std::time::Duration::from_secs(86_400);

/// Validate config, initialize every subsystem, and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Repositories ─────────────────────────────────────────────────
    let stores = if config.database_url.is_empty() {
        tracing::info!("using in-memory repositories");
        memory_stores()
    } else {
        let pg = PgStore::connect(
            &config.database_url,
            config.db_pool_size,
            config.db_pool_max_overflow,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("connecting to PostgreSQL")?;
        pg.ensure_schema()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("applying database schema")?;
        tracing::info!(
            pool_size = config.db_pool_size,
            max_overflow = config.db_pool_max_overflow,
            "PostgreSQL repositories ready"
        );
        pg.stores()
    };

    // ── KV (locks, counters, cache) ──────────────────────────────────
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    if config.kv_url.is_empty() {
        tracing::info!("using in-process KV backend");
    } else {
        tracing::warn!(
            url = %config.kv_url,
            "KV_URL is set but no external KV binding is compiled in; \
             coordination uses the in-process backend"
        );
    }

    // ── Blob store + URL signing ─────────────────────────────────────
    let signer = Arc::new(UrlSigner::new(
        &config.signing_secret,
        &config.public_base_url,
    ));
    let blob: Arc<dyn BlobStore> =
        Arc::new(FsBlobStore::new(config.artifacts_root.clone(), signer.clone()));
    tracing::info!(root = %config.artifacts_root, "artifact blob store ready");

    // ── Execution plumbing ───────────────────────────────────────────
    let cache = Arc::new(ReportCache::new(kv.clone()));
    let burst = Arc::new(BurstProtection::new(kv.clone(), BurstCaps::default()));
    let queue = Arc::new(MemoryQueue::new());
    let email = Arc::new(EmailService::from_config(&config));

    // ── Domain services ──────────────────────────────────────────────
    let schedules = Arc::new(ScheduleService::new(stores.schedules.clone()));
    let definitions = Arc::new(ReportDefinitionService::new(
        stores.definitions.clone(),
        cache.clone(),
    ));
    let audit = Arc::new(AuditService::new(stores.audit.clone()));

    // ── Pipeline, scheduler, sweeper ─────────────────────────────────
    let pipeline = Arc::new(ExecutionPipeline::new(
        stores.clone(),
        cache.clone(),
        burst.clone(),
        blob.clone(),
        email.clone(),
        Arc::new(InlineDataSource),
        Arc::new(TableTemplateRenderer),
        Arc::new(TextPdfRenderer),
        PipelineConfig::default(),
    ));
    let scheduler = Arc::new(SchedulerLoop::new(
        stores.schedules.clone(),
        kv.clone(),
        burst.clone(),
        queue.clone() as Arc<dyn TaskQueue>,
    ));
    let sweeper = Arc::new(RetentionSweeper::new(stores.artifacts.clone(), blob.clone()));
    tracing::info!("execution pipeline ready");

    Ok(AppState {
        config,
        stores,
        kv,
        blob,
        signer,
        schedules,
        definitions,
        audit,
        cache,
        burst,
        queue,
        email,
        pipeline,
        scheduler,
        sweeper,
    })
}

/// Spawn the long-running background tasks. `run_scheduler` follows
/// `ENABLE_SCHEDULER` (workers turn it off); `run_worker` drains the
/// in-process report queue.
pub fn spawn_background(
    state: &AppState,
    run_scheduler: bool,
    run_worker: bool,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if run_scheduler {
        let scheduler = state.scheduler.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_INTERVAL);
            loop {
                ticker.tick().await;
                scheduler.scan_once(Utc::now()).await;
            }
        }));
        tracing::info!(interval_secs = SCAN_INTERVAL.as_secs(), "scheduler loop started");
    }

    if run_worker {
        let queue = state.queue.clone();
        let pipeline = state.pipeline.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let task = queue.recv(QueueName::Reports).await;
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let _ = pipeline.process(task).await;
                });
            }
        }));
        tracing::info!("report worker started");
    }

    // Counter reconciliation.
    {
        let burst = state.burst.clone();
        let runs = state.stores.runs.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BURST_SYNC_INTERVAL);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                burst.sync(runs.as_ref()).await;
            }
        }));
    }

    // Daily retention sweep.
    {
        let sweeper = state.sweeper.clone();
        let retention_days = state.config.retention_days;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                sweeper.sweep(retention_days, false, Utc::now()).await;
            }
        }));
    }

    handles
}
