/// Error kinds surfaced by the write-side domain services.
///
/// The HTTP layer maps these onto the wire envelope; the scheduler and the
/// execution pipeline never see `QuotaExceeded` or `NotFound` — those are
/// client-facing validation outcomes.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("schedule limit reached ({limit} for {tier} tier)")]
    QuotaExceeded { limit: usize, tier: String },

    #[error("not found")]
    NotFound,

    #[error("storage: {0}")]
    Storage(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code used in API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCron(_) => "INVALID_CRON",
            Self::InvalidTimezone(_) => "INVALID_TIMEZONE",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::Storage(_) | Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::InvalidCron("x".into()).code(), "INVALID_CRON");
        assert_eq!(ServiceError::InvalidTimezone("x".into()).code(), "INVALID_TIMEZONE");
        assert_eq!(
            ServiceError::QuotaExceeded { limit: 10, tier: "standard".into() }.code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(ServiceError::NotFound.code(), "NOT_FOUND");
        assert_eq!(ServiceError::Internal("boom".into()).code(), "INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn quota_message_names_tier_and_limit() {
        let err = ServiceError::QuotaExceeded { limit: 50, tier: "premium".into() };
        let msg = err.to_string();
        assert!(msg.contains("50"));
        assert!(msg.contains("premium"));
    }
}
