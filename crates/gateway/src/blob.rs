//! Blob store collaborator — artifact byte storage plus signed capability
//! URLs.
//!
//! Path convention: `{tenant_id}/{execution_run_id}/report_{execution_run_id}.{format}`.
//! Every blob carries `tenant_id`, `execution_run_id`, `file_format`, and an
//! ISO-8601 UTC `uploaded_at` in its metadata. Signed URLs are bearer
//! capabilities: HMAC-SHA256 over `path|expiry`, verified with a
//! constant-time compare.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use courier_domain::model::OutputFormat;

pub const DEFAULT_SIGNED_URL_HOURS: i64 = 24;

/// Validity for long-retention URLs stored on the artifact row.
pub const LONG_RETENTION_SIGNED_URL_DAYS: i64 = 7;

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("signature rejected")]
    InvalidSignature,

    #[error("signed url expired")]
    Expired,

    #[error("storage io: {0}")]
    Io(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store artifact bytes; returns `(blob_path, file_size_bytes)`.
    async fn upload(
        &self,
        tenant_id: Uuid,
        execution_run_id: Uuid,
        content: &[u8],
        format: OutputFormat,
    ) -> Result<(String, u64), BlobError>;

    /// Issue a time-limited signed URL for a blob.
    async fn signed_url(
        &self,
        blob_path: &str,
        validity: Duration,
    ) -> Result<(String, DateTime<Utc>), BlobError>;

    async fn download(&self, blob_path: &str) -> Result<Vec<u8>, BlobError>;

    /// Returns whether the blob existed.
    async fn delete(&self, blob_path: &str) -> Result<bool, BlobError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// URL signing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies artifact capability URLs.
pub struct UrlSigner {
    key: Vec<u8>,
    base_url: String,
}

impl UrlSigner {
    /// An empty secret gets an ephemeral random key (dev mode): URLs stop
    /// verifying across restarts, which is acceptable there.
    pub fn new(secret: &str, base_url: &str) -> Self {
        let key = if secret.is_empty() {
            Uuid::new_v4().as_bytes().to_vec()
        } else {
            secret.as_bytes().to_vec()
        };
        Self {
            key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn signature(&self, blob_path: &str, expires_ts: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(format!("{blob_path}|{expires_ts}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build `{base}/artifacts/{path}?expires={ts}&sig={hex}`.
    pub fn sign(&self, blob_path: &str, expires_at: DateTime<Utc>) -> String {
        let ts = expires_at.timestamp();
        let sig = self.signature(blob_path, ts);
        format!("{}/artifacts/{blob_path}?expires={ts}&sig={sig}", self.base_url)
    }

    /// Verify a presented signature and expiry against `now`.
    pub fn verify(
        &self,
        blob_path: &str,
        expires_ts: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        let expected = self.signature(blob_path, expires_ts);
        let ok: bool = expected.as_bytes().ct_eq(sig.as_bytes()).into();
        if !ok {
            return Err(BlobError::InvalidSignature);
        }
        if now.timestamp() > expires_ts {
            return Err(BlobError::Expired);
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct BlobMetadata<'a> {
    tenant_id: Uuid,
    execution_run_id: Uuid,
    file_format: &'a str,
    uploaded_at: String,
}

/// Local-filesystem blob store. Production deployments bind a cloud store
/// behind [`BlobStore`]; the path convention and metadata contract are
/// identical.
pub struct FsBlobStore {
    root: PathBuf,
    signer: Arc<UrlSigner>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, signer: Arc<UrlSigner>) -> Self {
        Self {
            root: root.into(),
            signer,
        }
    }

    /// Reject absolute paths and traversal components before touching disk.
    fn resolve(&self, blob_path: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(blob_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(BlobError::InvalidPath(blob_path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

fn io_err(err: std::io::Error) -> BlobError {
    BlobError::Io(err.to_string())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(
        &self,
        tenant_id: Uuid,
        execution_run_id: Uuid,
        content: &[u8],
        format: OutputFormat,
    ) -> Result<(String, u64), BlobError> {
        let blob_path = format!(
            "{tenant_id}/{execution_run_id}/report_{execution_run_id}.{}",
            format.extension()
        );
        let full = self.resolve(&blob_path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&full, content).await.map_err(io_err)?;

        let metadata = BlobMetadata {
            tenant_id,
            execution_run_id,
            file_format: format.extension(),
            uploaded_at: Utc::now().to_rfc3339(),
        };
        let meta_path = full.with_extension(format!("{}.meta.json", format.extension()));
        let meta_raw = serde_json::to_vec_pretty(&metadata).map_err(|e| BlobError::Io(e.to_string()))?;
        tokio::fs::write(&meta_path, meta_raw).await.map_err(io_err)?;

        let size = content.len() as u64;
        tracing::info!(
            tenant_id = %tenant_id,
            execution_run_id = %execution_run_id,
            blob_path = %blob_path,
            file_size_bytes = size,
            "uploaded artifact"
        );
        Ok((blob_path, size))
    }

    async fn signed_url(
        &self,
        blob_path: &str,
        validity: Duration,
    ) -> Result<(String, DateTime<Utc>), BlobError> {
        self.resolve(blob_path)?;
        let expires_at = Utc::now() + validity;
        Ok((self.signer.sign(blob_path, expires_at), expires_at))
    }

    async fn download(&self, blob_path: &str) -> Result<Vec<u8>, BlobError> {
        let full = self.resolve(blob_path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(blob_path.to_string()))
            }
            Err(e) => Err(io_err(e)),
        }
    }

    async fn delete(&self, blob_path: &str) -> Result<bool, BlobError> {
        let full = self.resolve(blob_path)?;
        let meta = full.with_extension(match full.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.meta.json"),
            None => "meta.json".to_string(),
        });
        let _ = tokio::fs::remove_file(&meta).await;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                tracing::info!(blob_path = %blob_path, "deleted artifact blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(blob_path = %blob_path, "blob not found for deletion");
                Ok(false)
            }
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let signer = Arc::new(UrlSigner::new("test-secret", "http://localhost:8080"));
        let store = FsBlobStore::new(dir.path(), signer);
        (dir, store)
    }

    #[tokio::test]
    async fn upload_uses_path_convention_and_writes_metadata() {
        let (dir, store) = store();
        let tenant = Uuid::new_v4();
        let run = Uuid::new_v4();
        let (path, size) = store
            .upload(tenant, run, b"report body", OutputFormat::Pdf)
            .await
            .unwrap();
        assert_eq!(path, format!("{tenant}/{run}/report_{run}.pdf"));
        assert_eq!(size, 11);

        let meta_path = dir
            .path()
            .join(format!("{tenant}/{run}/report_{run}.pdf.meta.json"));
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(meta_path).unwrap()).unwrap();
        assert_eq!(meta["tenant_id"], serde_json::json!(tenant));
        assert_eq!(meta["file_format"], "pdf");
        assert!(meta["uploaded_at"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn download_roundtrip_and_not_found() {
        let (_dir, store) = store();
        let tenant = Uuid::new_v4();
        let run = Uuid::new_v4();
        let (path, _) = store
            .upload(tenant, run, b"bytes", OutputFormat::Csv)
            .await
            .unwrap();
        assert_eq!(store.download(&path).await.unwrap(), b"bytes");
        assert!(matches!(
            store.download("missing/blob.pdf").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (_dir, store) = store();
        let (path, _) = store
            .upload(Uuid::new_v4(), Uuid::new_v4(), b"x", OutputFormat::Pdf)
            .await
            .unwrap();
        assert!(store.delete(&path).await.unwrap());
        assert!(!store.delete(&path).await.unwrap());
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.download("../etc/passwd").await,
            Err(BlobError::InvalidPath(_))
        ));
        assert!(matches!(
            store.download("/etc/passwd").await,
            Err(BlobError::InvalidPath(_))
        ));
    }

    #[test]
    fn signed_url_verifies_and_expires() {
        let signer = UrlSigner::new("secret", "http://localhost:8080/");
        let now = Utc::now();
        let expires = now + Duration::hours(24);
        let url = signer.sign("t/r/report_r.pdf", expires);
        assert!(url.starts_with("http://localhost:8080/artifacts/t/r/report_r.pdf?expires="));

        let ts = expires.timestamp();
        let sig = url.split("sig=").nth(1).unwrap();
        assert!(signer.verify("t/r/report_r.pdf", ts, sig, now).is_ok());
        assert!(matches!(
            signer.verify("t/r/report_r.pdf", ts, "deadbeef", now),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify("t/r/report_r.pdf", ts, sig, expires + Duration::seconds(1)),
            Err(BlobError::Expired)
        ));
        // Tampered path fails even with a valid signature for another path.
        assert!(signer.verify("t/other/report.pdf", ts, sig, now).is_err());
    }

    #[test]
    fn empty_secret_gets_ephemeral_key() {
        let a = UrlSigner::new("", "http://x");
        let b = UrlSigner::new("", "http://x");
        let expires = Utc::now() + Duration::hours(1);
        assert_ne!(a.sign("p", expires), b.sign("p", expires));
    }
}
