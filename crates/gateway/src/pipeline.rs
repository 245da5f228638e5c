//! Execution pipeline — the worker-side state machine for one report task.
//!
//! Steps per attempt: burst bracket, run record, definition resolve, cache
//! consult, compute (query → template → PDF), artifact persist + signed
//! URL, email delivery with per-recipient receipts, finalize. Every attempt
//! writes a fresh run record; retries re-run the whole pipeline, which is
//! where the result cache earns its keep (a delivery failure retry skips
//! the recompute).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_domain::model::{
    Artifact, DeliveryChannel, DeliveryReceipt, DeliveryStatus, EmailDeliveryConfig,
    ExecutionRun, ReportDefinition, RunMetadata, RunStatus,
};

use crate::blob::{BlobStore, DEFAULT_SIGNED_URL_HOURS};
use crate::burst::BurstProtection;
use crate::cache::ReportCache;
use crate::dates::{incremental_range, named_range, DateRange};
use crate::email::{EmailError, EmailService};
use crate::queue::TaskDescriptor;
use crate::render::{DataSource, PdfRenderer, RenderError, TemplateRenderer};
use crate::storage::Stores;

pub const MAX_ATTEMPTS: u32 = 3;

/// Persisted error messages are truncated to this many characters.
const ERROR_MESSAGE_MAX: usize = 1000;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Cooperative limit, checked at step boundaries.
    pub soft_time_limit: Duration,
    /// The attempt is killed at this limit.
    pub hard_time_limit: Duration,
    pub max_attempts: u32,
    /// Linear backoff base: attempt N sleeps `N × retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            soft_time_limit: Duration::from_secs(300),
            hard_time_limit: Duration::from_secs(600),
            max_attempts: MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// The definition disappeared between enqueue and execute. Terminal.
    #[error("report definition not found: {0}")]
    DefinitionMissing(Uuid),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::DefinitionMissing(_))
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub artifact_id: Uuid,
    pub cache_hit: bool,
}

/// Unicode-safe truncation for persisted error messages.
fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX {
        return message.to_string();
    }
    message.chars().take(ERROR_MESSAGE_MAX).collect()
}

pub struct ExecutionPipeline {
    stores: Stores,
    cache: Arc<ReportCache>,
    burst: Arc<BurstProtection>,
    blob: Arc<dyn BlobStore>,
    email: Arc<EmailService>,
    source: Arc<dyn DataSource>,
    templates: Arc<dyn TemplateRenderer>,
    pdf: Arc<dyn PdfRenderer>,
    config: PipelineConfig,
}

impl ExecutionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        cache: Arc<ReportCache>,
        burst: Arc<BurstProtection>,
        blob: Arc<dyn BlobStore>,
        email: Arc<EmailService>,
        source: Arc<dyn DataSource>,
        templates: Arc<dyn TemplateRenderer>,
        pdf: Arc<dyn PdfRenderer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            stores,
            cache,
            burst,
            blob,
            email,
            source,
            templates,
            pdf,
            config,
        }
    }

    /// Process one dequeued descriptor to completion: up to
    /// `max_attempts` full pipeline executions with linear backoff, then
    /// acknowledge regardless (the run record carries the failure).
    pub async fn process(&self, task: TaskDescriptor) -> Result<RunOutcome, String> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            match tokio::time::timeout(self.config.hard_time_limit, self.execute(&task)).await {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        task_id = %task.task_id,
                        run_id = %outcome.run_id,
                        attempt,
                        cache_hit = outcome.cache_hit,
                        "report task completed"
                    );
                    return Ok(outcome);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        tracing::error!(
                            task_id = %task.task_id,
                            error = %e,
                            "terminal failure, acknowledging task"
                        );
                        return Err(last_error);
                    }
                    tracing::warn!(
                        task_id = %task.task_id,
                        attempt,
                        error = %e,
                        "attempt failed"
                    );
                }
                Err(_) => {
                    // Hard kill: the attempt's `exit` is lost and repaired
                    // by the periodic counter sync.
                    last_error = format!(
                        "hard time limit ({}s) exceeded",
                        self.config.hard_time_limit.as_secs()
                    );
                    tracing::error!(task_id = %task.task_id, attempt, "{last_error}");
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }
        tracing::error!(
            task_id = %task.task_id,
            error = %last_error,
            "report task failed after final retry"
        );
        Err(last_error)
    }

    /// One full pipeline attempt: creates its own run record and drives it
    /// to a terminal state.
    pub async fn execute(&self, task: &TaskDescriptor) -> Result<RunOutcome, PipelineError> {
        let started_at = Utc::now();
        self.burst.enter(task.tenant_id).await;

        let mut run = ExecutionRun {
            id: Uuid::new_v4(),
            tenant_id: task.tenant_id,
            schedule_id: task.schedule_id,
            report_definition_id: task.report_definition_id,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            metadata: RunMetadata {
                task_id: Some(task.task_id),
                ..RunMetadata::default()
            },
            created_at: started_at,
        };
        if let Err(e) = self.stores.runs.insert(run.clone()).await {
            self.burst.exit(task.tenant_id).await;
            return Err(PipelineError::Internal(format!("run insert: {e}")));
        }
        tracing::info!(
            run_id = %run.id,
            tenant_id = %task.tenant_id,
            report_definition_id = %task.report_definition_id,
            "started report generation"
        );

        let result = self.run_steps(task, &mut run, started_at).await;
        let now = Utc::now();
        match &result {
            Ok(_) => run.finish(RunStatus::Completed, now),
            Err(e) => {
                run.error_message = Some(truncate_error(&e.to_string()));
                run.finish(RunStatus::Failed, now);
            }
        }
        if let Err(e) = self.stores.runs.update(run.clone()).await {
            tracing::error!(run_id = %run.id, error = %e, "failed to persist run state");
        }
        self.burst.exit(task.tenant_id).await;

        result.map(|(artifact_id, cache_hit)| RunOutcome {
            run_id: run.id,
            artifact_id,
            cache_hit,
        })
    }

    fn check_soft_limit(
        &self,
        started_at: DateTime<Utc>,
        step: &str,
    ) -> Result<(), PipelineError> {
        let elapsed = (Utc::now() - started_at).num_seconds().max(0) as u64;
        if elapsed >= self.config.soft_time_limit.as_secs() {
            return Err(PipelineError::Transient(format!(
                "soft time limit ({}s) exceeded before {step}",
                self.config.soft_time_limit.as_secs()
            )));
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        task: &TaskDescriptor,
        run: &mut ExecutionRun,
        started_at: DateTime<Utc>,
    ) -> Result<(Uuid, bool), PipelineError> {
        // Resolve the definition.
        let definition = self
            .stores
            .definitions
            .find(task.report_definition_id, task.tenant_id)
            .await
            .map_err(|e| PipelineError::Internal(format!("definition lookup: {e}")))?
            .ok_or(PipelineError::DefinitionMissing(task.report_definition_id))?;

        let date_range = self.derive_range(&definition, started_at).await;

        // Cache consult.
        let mut bytes: Option<Vec<u8>> = None;
        if definition.is_cacheable() {
            if let Some((cached, metadata)) = self
                .cache
                .get(definition.id, &definition.query_spec, date_range.as_ref())
                .await
            {
                run.metadata.cache_hit = true;
                run.metadata.cached_at = Some(metadata.cached_at);
                bytes = Some(cached);
                tracing::info!(run_id = %run.id, "serving report from cache");
            }
        }
        let cache_hit = bytes.is_some();

        // Compute on miss.
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => {
                self.check_soft_limit(started_at, "data fetch")?;
                let data = self
                    .source
                    .query(&definition.query_spec, date_range.as_ref())
                    .await
                    .map_err(render_err)?;

                self.check_soft_limit(started_at, "template render")?;
                let html = self
                    .templates
                    .render(&definition.template_ref, &data, &definition.name)
                    .await
                    .map_err(render_err)?;

                self.check_soft_limit(started_at, "pdf render")?;
                let bytes = self.pdf.render(&html).await.map_err(render_err)?;

                if definition.is_cacheable() {
                    self.cache
                        .put(
                            definition.id,
                            &definition.query_spec,
                            date_range.as_ref(),
                            bytes.clone(),
                            definition.cache_ttl_seconds,
                            Some(run.id),
                            Some(definition.name.clone()),
                        )
                        .await;
                }
                bytes
            }
        };

        // Persist the artifact.
        self.check_soft_limit(started_at, "artifact upload")?;
        let (blob_path, file_size_bytes) = self
            .blob
            .upload(task.tenant_id, run.id, &bytes, definition.output_format)
            .await
            .map_err(|e| PipelineError::Transient(format!("blob upload: {e}")))?;
        let (signed_url, signed_url_expires_at) = self
            .blob
            .signed_url(&blob_path, chrono::Duration::hours(DEFAULT_SIGNED_URL_HOURS))
            .await
            .map_err(|e| PipelineError::Transient(format!("signed url: {e}")))?;

        let artifact = Artifact {
            id: Uuid::new_v4(),
            tenant_id: task.tenant_id,
            execution_run_id: run.id,
            blob_path,
            file_size_bytes,
            file_format: definition.output_format,
            signed_url: Some(signed_url.clone()),
            signed_url_expires_at: Some(signed_url_expires_at),
            created_at: Utc::now(),
        };
        let artifact = self
            .stores
            .artifacts
            .insert(artifact)
            .await
            .map_err(|e| PipelineError::Internal(format!("artifact insert: {e}")))?;

        // Deliver. A failed delivery never fails the run; the artifact
        // exists and stays fetchable.
        if let Some(config) = &task.email_delivery_config {
            if !config.recipients.is_empty() {
                self.deliver(task, &definition, &artifact, &signed_url, config, started_at)
                    .await;
            }
        }

        Ok((artifact.id, cache_hit))
    }

    /// Resolve the date range the definition asks for, if any:
    /// `query_spec.incremental = true` or `query_spec.date_range = "<name>"`.
    async fn derive_range(
        &self,
        definition: &ReportDefinition,
        now: DateTime<Utc>,
    ) -> Option<DateRange> {
        let spec = &definition.query_spec;
        if spec.get("incremental").and_then(|v| v.as_bool()) == Some(true) {
            let last = self
                .stores
                .runs
                .latest_completed(definition.tenant_id, definition.id)
                .await
                .ok()
                .flatten()
                .and_then(|run| run.completed_at);
            return Some(incremental_range(last, now));
        }
        spec.get("date_range")
            .and_then(|v| v.as_str())
            .map(|name| named_range(name, now))
    }

    async fn deliver(
        &self,
        task: &TaskDescriptor,
        definition: &ReportDefinition,
        artifact: &Artifact,
        signed_url: &str,
        config: &EmailDeliveryConfig,
        started_at: DateTime<Utc>,
    ) {
        let subject = config
            .subject
            .clone()
            .unwrap_or_else(|| format!("Report: {}", definition.name));
        let execution_time = started_at.to_rfc3339();

        for (i, recipient) in config.recipients.iter().enumerate() {
            // cc/bcc ride the first recipient's message only.
            let (cc, bcc) = if i == 0 {
                (
                    config.cc.clone().unwrap_or_default(),
                    config.bcc.clone().unwrap_or_default(),
                )
            } else {
                (Vec::new(), Vec::new())
            };
            let sent = self
                .email
                .send_report_email(
                    vec![recipient.clone()],
                    cc,
                    bcc,
                    &subject,
                    &definition.name,
                    signed_url,
                    &execution_time,
                )
                .await;

            let receipt = match sent {
                Ok(_) => DeliveryReceipt {
                    id: Uuid::new_v4(),
                    tenant_id: task.tenant_id,
                    artifact_id: artifact.id,
                    channel: DeliveryChannel::Email,
                    recipient: recipient.clone(),
                    status: DeliveryStatus::Sent,
                    sent_at: Some(Utc::now()),
                    error_message: None,
                    created_at: Utc::now(),
                },
                Err(ref e) => DeliveryReceipt {
                    id: Uuid::new_v4(),
                    tenant_id: task.tenant_id,
                    artifact_id: artifact.id,
                    channel: DeliveryChannel::Email,
                    recipient: recipient.clone(),
                    status: DeliveryStatus::Failed,
                    sent_at: None,
                    error_message: Some(truncate_error(&e.to_string())),
                    created_at: Utc::now(),
                },
            };
            if let Err(e) = self.stores.receipts.insert(receipt).await {
                tracing::error!(
                    artifact_id = %artifact.id,
                    recipient = %recipient,
                    error = %e,
                    "failed to record delivery receipt"
                );
            }
            match sent {
                Ok(message_id) => tracing::info!(
                    artifact_id = %artifact.id,
                    recipient = %recipient,
                    message_id,
                    "report delivered"
                ),
                Err(EmailError::NotConfigured) => tracing::warn!(
                    artifact_id = %artifact.id,
                    recipient = %recipient,
                    "email not configured, delivery recorded as failed"
                ),
                Err(e) => tracing::error!(
                    artifact_id = %artifact.id,
                    recipient = %recipient,
                    error = %e,
                    "report delivery failed"
                ),
            }
        }
    }
}

fn render_err(err: RenderError) -> PipelineError {
    match err {
        RenderError::Source(msg) => PipelineError::Transient(format!("data source: {msg}")),
        RenderError::Template(msg) => PipelineError::Internal(format!("template: {msg}")),
        RenderError::Pdf(msg) => PipelineError::Internal(format!("pdf: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::BurstCaps;
    use crate::kv::MemoryKv;
    use crate::render::{InlineDataSource, TableTemplateRenderer, TextPdfRenderer};
    use crate::storage::memory::memory_stores;
    use crate::storage::{ArtifactRepo, DefinitionRepo, ReceiptRepo, RunRepo};
    use async_trait::async_trait;
    use courier_domain::model::OutputFormat;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: InlineDataSource,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn query(
            &self,
            spec: &serde_json::Value,
            range: Option<&DateRange>,
        ) -> Result<serde_json::Value, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.query(spec, range).await
        }
    }

    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        async fn query(
            &self,
            _: &serde_json::Value,
            _: Option<&DateRange>,
        ) -> Result<serde_json::Value, RenderError> {
            Err(RenderError::Source("warehouse timeout".into()))
        }
    }

    struct RecordingSender {
        sent: Mutex<Vec<crate::email::EmailMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl crate::email::EmailSender for RecordingSender {
        async fn send(
            &self,
            message: &crate::email::EmailMessage,
        ) -> Result<String, EmailError> {
            self.sent.lock().push(message.clone());
            if self.fail {
                Err(EmailError::Transport("550 mailbox unavailable".into()))
            } else {
                Ok(format!("msg-{}", self.sent.lock().len()))
            }
        }
    }

    struct Rig {
        stores: Stores,
        cache: Arc<ReportCache>,
        source: Arc<CountingSource>,
        sender: Arc<RecordingSender>,
        pipeline: ExecutionPipeline,
    }

    fn rig_with(fail_email: bool, config: PipelineConfig) -> Rig {
        let stores = memory_stores();
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ReportCache::new(kv.clone()));
        let burst = Arc::new(BurstProtection::new(kv.clone(), BurstCaps::default()));
        let signer = Arc::new(crate::blob::UrlSigner::new("secret", "http://localhost:8080"));
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(crate::blob::FsBlobStore::new(dir.into_path(), signer));
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            fail: fail_email,
        });
        let email = Arc::new(EmailService::with_sender(sender.clone(), "noreply@test"));
        let source = Arc::new(CountingSource {
            inner: InlineDataSource,
            calls: AtomicUsize::new(0),
        });
        let pipeline = ExecutionPipeline::new(
            stores.clone(),
            cache.clone(),
            burst,
            blob,
            email,
            source.clone(),
            Arc::new(TableTemplateRenderer),
            Arc::new(TextPdfRenderer),
            config,
        );
        Rig {
            stores,
            cache,
            source,
            sender,
            pipeline,
        }
    }

    fn rig() -> Rig {
        rig_with(false, PipelineConfig::default())
    }

    async fn seed_definition(stores: &Stores, tenant: Uuid, cache_ttl: u64) -> ReportDefinition {
        let definition = ReportDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "sales".into(),
            query_spec: serde_json::json!({"rows": [{"product": "A", "revenue": 100}]}),
            template_ref: "templates/default".into(),
            output_format: OutputFormat::Pdf,
            cache_ttl_seconds: cache_ttl,
            created_at: Utc::now(),
        };
        stores.definitions.create(definition.clone()).await.unwrap();
        definition
    }

    fn task(tenant: Uuid, definition: &ReportDefinition, recipients: Vec<String>) -> TaskDescriptor {
        TaskDescriptor {
            task_id: Uuid::new_v4(),
            tenant_id: tenant,
            schedule_id: None,
            report_definition_id: definition.id,
            email_delivery_config: if recipients.is_empty() {
                None
            } else {
                Some(EmailDeliveryConfig {
                    recipients,
                    cc: None,
                    bcc: None,
                    subject: None,
                })
            },
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_produces_run_artifact_and_receipt() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 0).await;
        let descriptor = task(tenant, &definition, vec!["a@x".into()]);

        let outcome = rig.pipeline.execute(&descriptor).await.unwrap();
        assert!(!outcome.cache_hit);

        let run = rig
            .stores
            .runs
            .find(outcome.run_id, tenant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.duration_seconds.is_some());
        assert_eq!(run.metadata.task_id, Some(descriptor.task_id));

        let artifact = rig
            .stores
            .artifacts
            .find_by_run(outcome.run_id, tenant)
            .await
            .unwrap()
            .unwrap();
        assert!(artifact.blob_path.contains(&outcome.run_id.to_string()));
        assert!(artifact.signed_url.as_deref().unwrap().contains("sig="));
        assert!(artifact.file_size_bytes > 0);

        let receipts = rig
            .stores
            .receipts
            .list_for_artifact(tenant, artifact.id)
            .await
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, DeliveryStatus::Sent);
        assert_eq!(receipts[0].recipient, "a@x");
        assert!(receipts[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn missing_definition_is_terminal_failure() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let descriptor = TaskDescriptor {
            task_id: Uuid::new_v4(),
            tenant_id: tenant,
            schedule_id: None,
            report_definition_id: Uuid::new_v4(),
            email_delivery_config: None,
            enqueued_at: Utc::now(),
        };
        let err = rig.pipeline.execute(&descriptor).await.unwrap_err();
        assert!(matches!(err, PipelineError::DefinitionMissing(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn failed_run_has_no_artifact_and_truncated_error() {
        let stores = memory_stores();
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ReportCache::new(kv.clone()));
        let burst = Arc::new(BurstProtection::new(kv.clone(), BurstCaps::default()));
        let signer = Arc::new(crate::blob::UrlSigner::new("secret", "http://x"));
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(crate::blob::FsBlobStore::new(dir.into_path(), signer));
        let pipeline = ExecutionPipeline::new(
            stores.clone(),
            cache,
            burst,
            blob,
            Arc::new(EmailService::disabled("noreply@test")),
            Arc::new(FailingSource),
            Arc::new(TableTemplateRenderer),
            Arc::new(TextPdfRenderer),
            PipelineConfig::default(),
        );

        let tenant = Uuid::new_v4();
        let definition = seed_definition(&stores, tenant, 0).await;
        let descriptor = task(tenant, &definition, vec![]);

        let err = pipeline.execute(&descriptor).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transient(_)));

        // P2: a failed terminal run has zero artifacts.
        let run = stores
            .runs
            .latest_completed(tenant, definition.id)
            .await
            .unwrap();
        assert!(run.is_none());
        let expired = stores
            .artifacts
            .find_expired(Utc::now() + chrono::Duration::days(1), 100)
            .await
            .unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn error_message_is_truncated_to_one_thousand_chars() {
        assert_eq!(truncate_error(&"x".repeat(5000)).chars().count(), 1000);
        assert_eq!(truncate_error("short"), "short");
        // Multi-byte safety.
        let long = "é".repeat(2000);
        assert_eq!(truncate_error(&long).chars().count(), 1000);
    }

    #[tokio::test]
    async fn cache_hit_skips_compute_and_returns_identical_bytes() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 3600).await;

        let first = rig
            .pipeline
            .execute(&task(tenant, &definition, vec![]))
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(rig.source.calls.load(Ordering::SeqCst), 1);

        let second = rig
            .pipeline
            .execute(&task(tenant, &definition, vec![]))
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(
            rig.source.calls.load(Ordering::SeqCst),
            1,
            "data source must not be invoked on a cache hit"
        );

        let run = rig
            .stores
            .runs
            .find(second.run_id, tenant)
            .await
            .unwrap()
            .unwrap();
        assert!(run.metadata.cache_hit);
        assert!(run.metadata.cached_at.is_some());

        // Byte-identical artifacts via the cache.
        let a = rig.stores.artifacts.find_by_run(first.run_id, tenant).await.unwrap().unwrap();
        let b = rig.stores.artifacts.find_by_run(second.run_id, tenant).await.unwrap().unwrap();
        assert_eq!(a.file_size_bytes, b.file_size_bytes);
        let cached = rig
            .cache
            .get(definition.id, &definition.query_spec, None)
            .await
            .unwrap();
        assert_eq!(cached.0.len() as u64, a.file_size_bytes);
    }

    #[tokio::test]
    async fn uncacheable_definition_always_computes() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 0).await;
        rig.pipeline.execute(&task(tenant, &definition, vec![])).await.unwrap();
        rig.pipeline.execute(&task(tenant, &definition, vec![])).await.unwrap();
        assert_eq!(rig.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delivery_failure_does_not_fail_the_run() {
        let rig = rig_with(true, PipelineConfig::default());
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 0).await;
        let outcome = rig
            .pipeline
            .execute(&task(tenant, &definition, vec!["a@x".into(), "b@x".into()]))
            .await
            .unwrap();

        let run = rig.stores.runs.find(outcome.run_id, tenant).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let receipts = rig
            .stores
            .receipts
            .list_for_artifact(tenant, outcome.artifact_id)
            .await
            .unwrap();
        assert_eq!(receipts.len(), 2, "one receipt per recipient");
        assert!(receipts.iter().all(|r| r.status == DeliveryStatus::Failed));
        assert!(receipts
            .iter()
            .all(|r| r.error_message.as_deref().unwrap().contains("550")));
    }

    #[tokio::test]
    async fn each_recipient_gets_own_send() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 0).await;
        rig.pipeline
            .execute(&task(tenant, &definition, vec!["a@x".into(), "b@x".into(), "c@x".into()]))
            .await
            .unwrap();
        let sent = rig.sender.sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.to.len() == 1));
    }

    #[tokio::test]
    async fn retries_then_acknowledges_after_final_failure() {
        let stores = memory_stores();
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ReportCache::new(kv.clone()));
        let burst = Arc::new(BurstProtection::new(kv.clone(), BurstCaps::default()));
        let signer = Arc::new(crate::blob::UrlSigner::new("secret", "http://x"));
        let dir = tempfile::tempdir().unwrap();
        let blob = Arc::new(crate::blob::FsBlobStore::new(dir.into_path(), signer));
        let pipeline = ExecutionPipeline::new(
            stores.clone(),
            cache,
            burst.clone(),
            blob,
            Arc::new(EmailService::disabled("noreply@test")),
            Arc::new(FailingSource),
            Arc::new(TableTemplateRenderer),
            Arc::new(TextPdfRenderer),
            PipelineConfig {
                retry_backoff: Duration::from_millis(1),
                ..PipelineConfig::default()
            },
        );

        let tenant = Uuid::new_v4();
        let definition = seed_definition(&stores, tenant, 0).await;
        let err = pipeline.process(task(tenant, &definition, vec![])).await.unwrap_err();
        assert!(err.contains("warehouse timeout"));

        // Three attempts, three failed run records, counters drained.
        let counts = stores.runs.running_counts().await.unwrap();
        assert!(counts.is_empty(), "no runs left pending/running");
        let burst_counts = burst.current_counts(Some(tenant)).await;
        assert_eq!(burst_counts.tenant_running, 0);
        assert_eq!(burst_counts.global_running, 0);
    }

    #[tokio::test]
    async fn terminal_definition_missing_is_not_retried() {
        let rig = rig_with(
            false,
            PipelineConfig {
                retry_backoff: Duration::from_millis(1),
                ..PipelineConfig::default()
            },
        );
        let descriptor = TaskDescriptor {
            task_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            schedule_id: None,
            report_definition_id: Uuid::new_v4(),
            email_delivery_config: None,
            enqueued_at: Utc::now(),
        };
        let err = rig.pipeline.process(descriptor).await.unwrap_err();
        assert!(err.contains("not found"));
        assert_eq!(rig.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn incremental_range_reads_previous_completion() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = ReportDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "incremental".into(),
            query_spec: serde_json::json!({"rows": [], "incremental": true}),
            template_ref: "t".into(),
            output_format: OutputFormat::Pdf,
            cache_ttl_seconds: 0,
            created_at: Utc::now(),
        };
        rig.stores.definitions.create(definition.clone()).await.unwrap();

        let now = Utc::now();
        let range = rig.pipeline.derive_range(&definition, now).await.unwrap();
        assert_eq!(range.range_type, "incremental");
        assert_eq!(range.start, now - chrono::Duration::days(7), "first run window");

        // After a completed run, the window starts at completion − overlap.
        let first = rig
            .pipeline
            .execute(&task(tenant, &definition, vec![]))
            .await
            .unwrap();
        let completed = rig
            .stores
            .runs
            .find(first.run_id, tenant)
            .await
            .unwrap()
            .unwrap()
            .completed_at
            .unwrap();
        let range = rig.pipeline.derive_range(&definition, now).await.unwrap();
        assert_eq!(range.start, completed - chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn named_range_hint_is_honored() {
        let rig = rig();
        let tenant = Uuid::new_v4();
        let definition = ReportDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "monthly".into(),
            query_spec: serde_json::json!({"rows": [], "date_range": "month_to_date"}),
            template_ref: "t".into(),
            output_format: OutputFormat::Pdf,
            cache_ttl_seconds: 0,
            created_at: Utc::now(),
        };
        rig.stores.definitions.create(definition.clone()).await.unwrap();
        let range = rig.pipeline.derive_range(&definition, Utc::now()).await.unwrap();
        assert_eq!(range.range_type, "month_to_date");
    }

    #[tokio::test]
    async fn soft_limit_aborts_at_step_boundary() {
        let rig = rig_with(
            false,
            PipelineConfig {
                soft_time_limit: Duration::from_secs(0),
                retry_backoff: Duration::from_millis(1),
                max_attempts: 1,
                ..PipelineConfig::default()
            },
        );
        let tenant = Uuid::new_v4();
        let definition = seed_definition(&rig.stores, tenant, 0).await;
        let err = rig
            .pipeline
            .execute(&task(tenant, &definition, vec![]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("soft time limit"));
        assert_eq!(rig.source.calls.load(Ordering::SeqCst), 0);
    }
}
