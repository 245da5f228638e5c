//! Environment-driven application configuration.
//!
//! Every recognized option has a default suitable for local development; a
//! production deployment sets the connection strings. `validate()` reports
//! issues with severities so the server can refuse to boot on hard errors
//! while logging soft ones.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ── Database ─────────────────────────────────────────────────────
    /// PostgreSQL connection string. Empty selects the in-memory backends
    /// (dev/local only).
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "d_pool_size")]
    pub db_pool_size: u32,
    #[serde(default = "d_pool_overflow")]
    pub db_pool_max_overflow: u32,

    // ── Distributed KV (locks, counters, cache) ──────────────────────
    #[serde(default)]
    pub kv_url: String,

    // ── Object storage ───────────────────────────────────────────────
    #[serde(default)]
    pub storage_connection_string: String,
    #[serde(default = "d_container")]
    pub storage_container_name: String,
    /// Filesystem root for the local blob backend.
    #[serde(default = "d_artifacts_root")]
    pub artifacts_root: String,

    // ── Task queue broker ────────────────────────────────────────────
    #[serde(default)]
    pub queue_broker_url: String,
    #[serde(default)]
    pub queue_result_backend_url: String,

    // ── Email ────────────────────────────────────────────────────────
    #[serde(default)]
    pub email_connection_string: String,
    #[serde(default = "d_from_address")]
    pub email_from_address: String,

    // ── Auth (verified by the fronting gateway) ──────────────────────
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "d_jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default)]
    pub jwt_issuer: String,
    #[serde(default = "d_jwt_audience")]
    pub jwt_audience: String,

    // ── Application ──────────────────────────────────────────────────
    #[serde(default = "d_environment")]
    pub environment: String,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default = "d_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "d_bind_addr")]
    pub bind_addr: String,
    /// Base URL used when issuing signed artifact URLs.
    #[serde(default = "d_public_base_url")]
    pub public_base_url: String,
    /// HMAC key for signed artifact URLs.
    #[serde(default)]
    pub signing_secret: String,

    // ── Scheduler & retention ────────────────────────────────────────
    /// The scheduler loop is opt-out on workers.
    #[serde(default = "d_true")]
    pub enable_scheduler: bool,
    #[serde(default = "d_retention_days")]
    pub retention_days: i64,
}

fn d_pool_size() -> u32 {
    20
}
fn d_pool_overflow() -> u32 {
    10
}
fn d_container() -> String {
    "artifacts".to_string()
}
fn d_artifacts_root() -> String {
    "./data/artifacts".to_string()
}
fn d_from_address() -> String {
    "noreply@courier.local".to_string()
}
fn d_jwt_algorithm() -> String {
    "HS256".to_string()
}
fn d_jwt_audience() -> String {
    "courier-api".to_string()
}
fn d_environment() -> String {
    "dev".to_string()
}
fn d_log_level() -> String {
    "info".to_string()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}
fn d_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn d_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn d_true() -> bool {
    true
}
fn d_retention_days() -> i64 {
    90
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_pool_size: d_pool_size(),
            db_pool_max_overflow: d_pool_overflow(),
            kv_url: String::new(),
            storage_connection_string: String::new(),
            storage_container_name: d_container(),
            artifacts_root: d_artifacts_root(),
            queue_broker_url: String::new(),
            queue_result_backend_url: String::new(),
            email_connection_string: String::new(),
            email_from_address: d_from_address(),
            jwt_secret: String::new(),
            jwt_algorithm: d_jwt_algorithm(),
            jwt_issuer: String::new(),
            jwt_audience: d_jwt_audience(),
            environment: d_environment(),
            log_level: d_log_level(),
            cors_origins: d_cors_origins(),
            bind_addr: d_bind_addr(),
            public_base_url: d_public_base_url(),
            signing_secret: String::new(),
            enable_scheduler: true,
            retention_days: d_retention_days(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Build from process environment variables (upper-snake names matching
    /// the field names, e.g. `DATABASE_URL`, `ENABLE_SCHEDULER`).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Some(v) = get("DB_POOL_SIZE").and_then(|v| v.parse().ok()) {
            cfg.db_pool_size = v;
        }
        if let Some(v) = get("DB_POOL_MAX_OVERFLOW").and_then(|v| v.parse().ok()) {
            cfg.db_pool_max_overflow = v;
        }
        if let Some(v) = get("KV_URL").or_else(|| get("REDIS_URL")) {
            cfg.kv_url = v;
        }
        if let Some(v) = get("STORAGE_CONNECTION_STRING") {
            cfg.storage_connection_string = v;
        }
        if let Some(v) = get("STORAGE_CONTAINER_NAME") {
            cfg.storage_container_name = v;
        }
        if let Some(v) = get("ARTIFACTS_ROOT") {
            cfg.artifacts_root = v;
        }
        if let Some(v) = get("QUEUE_BROKER_URL") {
            cfg.queue_broker_url = v;
        }
        if let Some(v) = get("QUEUE_RESULT_BACKEND_URL") {
            cfg.queue_result_backend_url = v;
        }
        if let Some(v) = get("EMAIL_CONNECTION_STRING") {
            cfg.email_connection_string = v;
        }
        if let Some(v) = get("EMAIL_FROM_ADDRESS") {
            cfg.email_from_address = v;
        }
        if let Some(v) = get("JWT_SECRET") {
            cfg.jwt_secret = v;
        }
        if let Some(v) = get("JWT_ALGORITHM") {
            cfg.jwt_algorithm = v;
        }
        if let Some(v) = get("JWT_ISSUER") {
            cfg.jwt_issuer = v;
        }
        if let Some(v) = get("JWT_AUDIENCE") {
            cfg.jwt_audience = v;
        }
        if let Some(v) = get("ENVIRONMENT") {
            cfg.environment = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = get("CORS_ORIGINS") {
            cfg.cors_origins = parse_origins(&v);
        }
        if let Some(v) = get("BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Some(v) = get("PUBLIC_BASE_URL") {
            cfg.public_base_url = v;
        }
        if let Some(v) = get("SIGNING_SECRET") {
            cfg.signing_secret = v;
        }
        if let Some(v) = get("ENABLE_SCHEDULER") {
            cfg.enable_scheduler = matches!(v.as_str(), "1" | "true" | "True" | "yes");
        }
        if let Some(v) = get("RETENTION_DAYS").and_then(|v| v.parse().ok()) {
            cfg.retention_days = v;
        }
        cfg
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Report configuration problems. Errors block startup; warnings are
    /// logged and tolerated (dev mode runs without external services).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let warn = |msg: &str| ConfigIssue {
            severity: ConfigSeverity::Warning,
            message: msg.to_string(),
        };
        let error = |msg: &str| ConfigIssue {
            severity: ConfigSeverity::Error,
            message: msg.to_string(),
        };

        if self.is_production() {
            if self.database_url.is_empty() {
                issues.push(error("DATABASE_URL is required in production"));
            }
            if self.signing_secret.is_empty() {
                issues.push(error("SIGNING_SECRET is required in production"));
            }
            if self.jwt_secret.is_empty() {
                issues.push(error("JWT_SECRET is required in production"));
            }
        } else {
            if self.database_url.is_empty() {
                issues.push(warn("DATABASE_URL unset — using in-memory storage"));
            }
            if self.signing_secret.is_empty() {
                issues.push(warn("SIGNING_SECRET unset — signed URLs use an ephemeral key"));
            }
        }
        if self.email_connection_string.is_empty() {
            issues.push(warn("EMAIL_CONNECTION_STRING unset — email delivery disabled"));
        }
        if self.retention_days <= 0 {
            issues.push(error("RETENTION_DAYS must be positive"));
        }
        if self.db_pool_size == 0 {
            issues.push(error("DB_POOL_SIZE must be positive"));
        }
        issues
    }
}

/// Parse `CORS_ORIGINS` from a JSON array or a comma-separated list.
fn parse_origins(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list;
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
