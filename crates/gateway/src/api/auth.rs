//! Tenant context extraction.
//!
//! Authentication itself happens upstream (the fronting gateway verifies
//! the JWT); this adapter trusts the identity headers it forwards:
//! `x-tenant-id`, `x-tenant-tier`, and optionally `x-user-id`. Every
//! tenant-scoped handler takes a [`TenantContext`], so a request without a
//! tenant identity never reaches a repository.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use uuid::Uuid;

use courier_domain::model::TenantTier;

use super::ApiError;

#[derive(Clone, Debug)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub tier: TenantTier,
    pub user_id: Option<String>,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header(parts, "x-tenant-id")
            .and_then(|raw| raw.parse::<Uuid>().ok())
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "missing or invalid tenant context",
                )
            })?;
        let tier = header(parts, "x-tenant-tier")
            .and_then(|raw| raw.parse::<TenantTier>().ok())
            .unwrap_or(TenantTier::Standard);
        let user_id = header(parts, "x-user-id").map(String::from);
        Ok(Self {
            tenant_id,
            tier,
            user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<TenantContext, ApiError> {
        let (mut parts, _) = request.into_parts();
        TenantContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn extracts_tenant_tier_and_user() {
        let tenant = Uuid::new_v4();
        let request = Request::builder()
            .header("x-tenant-id", tenant.to_string())
            .header("x-tenant-tier", "premium")
            .header("x-user-id", "user-1")
            .body(())
            .unwrap();
        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.tenant_id, tenant);
        assert_eq!(ctx.tier, TenantTier::Premium);
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn missing_tenant_is_unauthorized() {
        let request = Request::builder().body(()).unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_tenant_id_is_rejected() {
        let request = Request::builder()
            .header("x-tenant-id", "not-a-uuid")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tier_defaults_to_standard() {
        let request = Request::builder()
            .header("x-tenant-id", Uuid::new_v4().to_string())
            .header("x-tenant-tier", "titanium")
            .body(())
            .unwrap();
        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.tier, TenantTier::Standard);
    }
}
