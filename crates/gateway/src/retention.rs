//! Retention sweeper — bulk deletion of artifacts past the retention
//! horizon.
//!
//! The blob is deleted before the database row; a blob-store failure skips
//! the row so a later sweep can complete both halves. Dry-run mode reports
//! what would be deleted without mutating anything.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::blob::BlobStore;
use crate::storage::ArtifactRepo;

/// Upper bound per sweep; a backlog drains across consecutive runs.
const SWEEP_BATCH: usize = 1000;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub total_expired: usize,
    pub deleted: usize,
    pub failed: usize,
    pub total_size_bytes: u64,
    pub dry_run: bool,
}

pub struct RetentionSweeper {
    artifacts: Arc<dyn ArtifactRepo>,
    blob: Arc<dyn BlobStore>,
}

impl RetentionSweeper {
    pub fn new(artifacts: Arc<dyn ArtifactRepo>, blob: Arc<dyn BlobStore>) -> Self {
        Self { artifacts, blob }
    }

    pub async fn sweep(
        &self,
        retention_days: i64,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let cutoff = now - Duration::days(retention_days);
        let expired = match self.artifacts.find_expired(cutoff, SWEEP_BATCH).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!(error = %e, "expired-artifact query failed");
                return SweepReport {
                    dry_run,
                    ..SweepReport::default()
                };
            }
        };

        let mut report = SweepReport {
            total_expired: expired.len(),
            dry_run,
            ..SweepReport::default()
        };
        tracing::info!(
            retention_days,
            dry_run,
            expired = expired.len(),
            "starting artifact retention sweep"
        );

        for artifact in expired {
            report.total_size_bytes += artifact.file_size_bytes;
            if dry_run {
                tracing::info!(
                    artifact_id = %artifact.id,
                    blob_path = %artifact.blob_path,
                    "dry run: would delete artifact"
                );
                report.deleted += 1;
                continue;
            }

            // Blob first. A missing blob is fine (half-completed earlier
            // sweep); a store failure leaves the row for the next sweep.
            match self.blob.delete(&artifact.blob_path).await {
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        artifact_id = %artifact.id,
                        blob_path = %artifact.blob_path,
                        error = %e,
                        "blob deletion failed, keeping row for retry"
                    );
                    continue;
                }
            }
            match self.artifacts.delete(artifact.id).await {
                Ok(_) => {
                    report.deleted += 1;
                    tracing::info!(
                        artifact_id = %artifact.id,
                        size_bytes = artifact.file_size_bytes,
                        "deleted expired artifact"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(artifact_id = %artifact.id, error = %e, "row deletion failed");
                }
            }
        }

        tracing::info!(
            deleted = report.deleted,
            failed = report.failed,
            total_size_bytes = report.total_size_bytes,
            "artifact retention sweep completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobError;
    use crate::storage::memory::MemoryArtifacts;
    use async_trait::async_trait;
    use courier_domain::model::{Artifact, OutputFormat};
    use parking_lot::Mutex;
    use uuid::Uuid;

    struct FakeBlob {
        deleted: Mutex<Vec<String>>,
        fail_paths: Vec<String>,
    }

    #[async_trait]
    impl BlobStore for FakeBlob {
        async fn upload(
            &self,
            _: Uuid,
            _: Uuid,
            _: &[u8],
            _: OutputFormat,
        ) -> Result<(String, u64), BlobError> {
            unreachable!("sweeper never uploads")
        }
        async fn signed_url(
            &self,
            _: &str,
            _: Duration,
        ) -> Result<(String, DateTime<Utc>), BlobError> {
            unreachable!("sweeper never signs")
        }
        async fn download(&self, _: &str) -> Result<Vec<u8>, BlobError> {
            unreachable!("sweeper never downloads")
        }
        async fn delete(&self, blob_path: &str) -> Result<bool, BlobError> {
            if self.fail_paths.iter().any(|p| p == blob_path) {
                return Err(BlobError::Io("storage 503".into()));
            }
            self.deleted.lock().push(blob_path.to_string());
            Ok(true)
        }
    }

    fn artifact(age_days: i64, size: u64) -> Artifact {
        let run = Uuid::new_v4();
        Artifact {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            execution_run_id: run,
            blob_path: format!("t/{run}/report_{run}.pdf"),
            file_size_bytes: size,
            file_format: OutputFormat::Pdf,
            signed_url: None,
            signed_url_expires_at: None,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn sweeps_only_past_horizon() {
        let artifacts = Arc::new(MemoryArtifacts::default());
        let old = artifact(120, 100);
        let fresh = artifact(10, 100);
        let fresh_id = fresh.id;
        artifacts.insert(old.clone()).await.unwrap();
        artifacts.insert(fresh.clone()).await.unwrap();

        let blob = Arc::new(FakeBlob {
            deleted: Mutex::new(Vec::new()),
            fail_paths: vec![],
        });
        let sweeper = RetentionSweeper::new(artifacts.clone(), blob.clone());
        let report = sweeper.sweep(90, false, Utc::now()).await;

        assert_eq!(report.total_expired, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(blob.deleted.lock().as_slice(), &[old.blob_path.clone()]);
        assert!(artifacts.find(fresh_id, fresh.tenant_id).await.unwrap().is_some());
        assert!(artifacts.find(old.id, old.tenant_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_counts_without_mutating() {
        let artifacts = Arc::new(MemoryArtifacts::default());
        let a = artifact(120, 700);
        let b = artifact(100, 300);
        artifacts.insert(a.clone()).await.unwrap();
        artifacts.insert(b.clone()).await.unwrap();

        let blob = Arc::new(FakeBlob {
            deleted: Mutex::new(Vec::new()),
            fail_paths: vec![],
        });
        let sweeper = RetentionSweeper::new(artifacts.clone(), blob.clone());
        let report = sweeper.sweep(90, true, Utc::now()).await;

        assert!(report.dry_run);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.total_size_bytes, 1000);
        assert!(blob.deleted.lock().is_empty());
        assert!(artifacts.find(a.id, a.tenant_id).await.unwrap().is_some());
        assert!(artifacts.find(b.id, b.tenant_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blob_failure_keeps_row_for_retry() {
        let artifacts = Arc::new(MemoryArtifacts::default());
        let stuck = artifact(120, 10);
        let ok = artifact(120, 10);
        artifacts.insert(stuck.clone()).await.unwrap();
        artifacts.insert(ok.clone()).await.unwrap();

        let blob = Arc::new(FakeBlob {
            deleted: Mutex::new(Vec::new()),
            fail_paths: vec![stuck.blob_path.clone()],
        });
        let sweeper = RetentionSweeper::new(artifacts.clone(), blob);
        let report = sweeper.sweep(90, false, Utc::now()).await;

        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
        // The stuck artifact's row survives so a later sweep retries both.
        assert!(artifacts.find(stuck.id, stuck.tenant_id).await.unwrap().is_some());
        assert!(artifacts.find(ok.id, ok.tenant_id).await.unwrap().is_none());
    }
}
