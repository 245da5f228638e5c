//! Signed artifact downloads.
//!
//! The URL is a bearer capability: anyone holding a valid, unexpired
//! signature gets the bytes. Successful downloads land in the audit log.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::blob::BlobError;
use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub expires: i64,
    pub sig: String,
}

fn content_type(blob_path: &str) -> &'static str {
    match blob_path.rsplit('.').next() {
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// GET /artifacts/*path?expires=&sig=
pub async fn download(
    State(state): State<AppState>,
    Path(blob_path): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let blob_path = blob_path.trim_start_matches('/').to_string();
    state
        .signer
        .verify(&blob_path, params.expires, &params.sig, chrono::Utc::now())
        .map_err(|e| match e {
            BlobError::Expired => {
                ApiError::new(StatusCode::FORBIDDEN, "URL_EXPIRED", "signed url expired")
            }
            _ => ApiError::new(StatusCode::FORBIDDEN, "INVALID_SIGNATURE", "signature rejected"),
        })?;

    let bytes = state.blob.download(&blob_path).await.map_err(|e| match e {
        BlobError::NotFound(_) => ApiError::not_found(),
        other => {
            tracing::error!(blob_path = %blob_path, error = %other, "artifact read failed");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "An unexpected error occurred. Please try again later.",
            )
        }
    })?;

    // Path convention: {tenant_id}/{execution_run_id}/report_….{format}.
    let mut segments = blob_path.split('/');
    let tenant_id = segments.next().and_then(|s| s.parse::<Uuid>().ok());
    let run_id = segments.next().and_then(|s| s.parse::<Uuid>().ok());
    if let (Some(tenant_id), Some(run_id)) = (tenant_id, run_id) {
        if let Ok(Some(artifact)) = state.stores.artifacts.find_by_run(run_id, tenant_id).await {
            if let Err(e) = state
                .audit
                .track_report_downloaded(tenant_id, artifact.id, None, "signed_url")
                .await
            {
                tracing::warn!(artifact_id = %artifact.id, error = %e, "download audit failed");
            }
        }
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type(&blob_path))],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type("t/r/report_r.pdf"), "application/pdf");
        assert_eq!(content_type("t/r/report_r.csv"), "text/csv");
        assert_eq!(
            content_type("t/r/report_r.xlsx"),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        assert_eq!(content_type("noext"), "application/octet-stream");
    }
}
