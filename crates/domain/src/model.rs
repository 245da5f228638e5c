//! Entity model — tenants, report definitions, schedules, execution runs,
//! artifacts, delivery receipts, and audit events.
//!
//! Every entity except `Tenant` itself is tenant-scoped; repositories filter
//! by `tenant_id` on every read and write. All timestamps are UTC instants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tenant
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tenant tier. Determines the per-tenant active-schedule quota.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Standard,
    Premium,
    Enterprise,
}

impl TenantTier {
    /// Maximum number of active schedules for this tier.
    pub fn schedule_quota(self) -> usize {
        match self {
            Self::Standard => 10,
            Self::Premium => 50,
            Self::Enterprise => 200,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for TenantTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tenant tier: '{other}'")),
        }
    }
}

/// Tenant record. Lifecycle is managed externally; Courier only reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub tier: TenantTier,
    pub active: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Pdf,
    Csv,
    Xlsx,
}

impl OutputFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(Self::Pdf),
            "csv" => Ok(Self::Csv),
            "xlsx" => Ok(Self::Xlsx),
            other => Err(format!("unknown output format: '{other}'")),
        }
    }
}

/// What to generate: an opaque query payload for the data source plus a
/// presentation template locator. Immutable from the scheduler's
/// perspective; updating one invalidates its cache entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Opaque structured payload passed to the data source. May carry
    /// `date_range` / `incremental` hints read by the execution pipeline.
    pub query_spec: serde_json::Value,
    /// Opaque locator for the presentation template.
    pub template_ref: String,
    pub output_format: OutputFormat,
    /// Seconds a generated artifact may be served from the result cache.
    /// Zero means uncacheable.
    #[serde(default)]
    pub cache_ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
}

impl ReportDefinition {
    pub fn is_cacheable(&self) -> bool {
        self.cache_ttl_seconds > 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Email delivery settings attached to a schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailDeliveryConfig {
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// A cron-driven trigger for one report definition.
///
/// Invariants: an active schedule always carries a `next_run_at`; when set,
/// `next_run_at` is the cron expression's next fire at-or-after
/// `max(now, last_run_at)` evaluated in `timezone` and stored in UTC; the
/// cron expression is validated before any persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub report_definition_id: Uuid,
    pub name: String,
    /// 5-field cron: "minute hour dom month dow".
    pub cron_expression: String,
    /// IANA timezone name the cron is evaluated in.
    pub timezone: String,
    pub active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_delivery_config: Option<EmailDeliveryConfig>,
    /// Recorded when the scheduler deactivates the schedule (e.g. a
    /// previously valid cron stops resolving under a tz table update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal states never change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: '{other}'")),
        }
    }
}

/// Free-form run bookkeeping (broker task id, cache-hit flag).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

/// One attempt at generating and delivering a report.
/// `schedule_id` is empty for manual runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub report_definition_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    /// Truncated to 1000 characters before persistence.
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: RunMetadata,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRun {
    /// Move to a terminal state, stamping completion time and duration.
    pub fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_seconds().max(0));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact & delivery receipt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The stored byte payload of a generated report. At most one per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub execution_run_id: Uuid,
    pub blob_path: String,
    pub file_size_bytes: u64,
    pub file_format: OutputFormat,
    /// Cache of the latest issued signed URL.
    pub signed_url: Option<String>,
    pub signed_url_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Email,
    Webhook,
    Slack,
}

impl DeliveryChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Slack => "slack",
        }
    }
}

impl std::str::FromStr for DeliveryChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "webhook" => Ok(Self::Webhook),
            "slack" => Ok(Self::Slack),
            other => Err(format!("unknown delivery channel: '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Bounced,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "bounced" => Ok(Self::Bounced),
            other => Err(format!("unknown delivery status: '{other}'")),
        }
    }
}

/// One receipt per `(artifact, recipient)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub artifact_id: Uuid,
    pub channel: DeliveryChannel,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ReportViewed,
    ReportDownloaded,
    ReportShared,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReportViewed => "report_viewed",
            Self::ReportDownloaded => "report_downloaded",
            Self::ReportShared => "report_shared",
        }
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report_viewed" => Ok(Self::ReportViewed),
            "report_downloaded" => Ok(Self::ReportDownloaded),
            "report_shared" => Ok(Self::ReportShared),
            other => Err(format!("unknown audit event type: '{other}'")),
        }
    }
}

/// Append-only record of a user-visible action on an artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: AuditEventType,
    pub resource_type: String,
    pub resource_id: String,
    /// Channel-specific fields: user id, ip address, share recipients, …
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_quotas() {
        assert_eq!(TenantTier::Standard.schedule_quota(), 10);
        assert_eq!(TenantTier::Premium.schedule_quota(), 50);
        assert_eq!(TenantTier::Enterprise.schedule_quota(), 200);
    }

    #[test]
    fn tier_parses_from_str() {
        assert_eq!("standard".parse::<TenantTier>().unwrap(), TenantTier::Standard);
        assert_eq!("enterprise".parse::<TenantTier>().unwrap(), TenantTier::Enterprise);
        assert!("platinum".parse::<TenantTier>().is_err());
    }

    #[test]
    fn run_status_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn run_finish_stamps_duration() {
        let started = Utc::now();
        let mut run = ExecutionRun {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            schedule_id: None,
            report_definition_id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: started,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            metadata: RunMetadata::default(),
            created_at: started,
        };
        run.finish(RunStatus::Completed, started + chrono::Duration::seconds(42));
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.duration_seconds, Some(42));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn output_format_extensions() {
        assert_eq!(OutputFormat::Pdf.extension(), "pdf");
        assert_eq!(OutputFormat::Csv.extension(), "csv");
        assert_eq!(OutputFormat::Xlsx.extension(), "xlsx");
    }

    #[test]
    fn cacheable_only_with_positive_ttl() {
        let mut def = ReportDefinition {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "sales".into(),
            query_spec: serde_json::json!({}),
            template_ref: "templates/default".into(),
            output_format: OutputFormat::Pdf,
            cache_ttl_seconds: 0,
            created_at: Utc::now(),
        };
        assert!(!def.is_cacheable());
        def.cache_ttl_seconds = 3600;
        assert!(def.is_cacheable());
    }

    #[test]
    fn email_config_optional_fields_roundtrip() {
        let cfg = EmailDeliveryConfig {
            recipients: vec!["a@example.com".into()],
            cc: None,
            bcc: Some(vec!["archive@example.com".into()]),
            subject: Some("Weekly sales".into()),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("\"cc\""));
        let back: EmailDeliveryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recipients.len(), 1);
        assert_eq!(back.bcc.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn audit_event_type_names() {
        assert_eq!(AuditEventType::ReportViewed.as_str(), "report_viewed");
        assert_eq!(AuditEventType::ReportDownloaded.as_str(), "report_downloaded");
        assert_eq!(AuditEventType::ReportShared.as_str(), "report_shared");
    }
}
