//! Result cache — content-addressed artifact cache over the KV store.
//!
//! Keys are sha256 fingerprints of `(report_definition_id, query_parameters,
//! date_range)` in canonical (recursively key-sorted) JSON. Each fingerprint
//! owns two entries with a shared TTL: the artifact bytes and a metadata
//! record. A per-report secondary index makes whole-report invalidation
//! O(matches). Best-effort: backend errors degrade to a miss, duplicate puts
//! are idempotent (last writer wins).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::dates::DateRange;
use crate::kv::Kv;

pub const DEFAULT_TTL_SECONDS: u64 = 3600;

const CACHE_KEY_PREFIX: &str = "report_cache:";
const METADATA_SUFFIX: &str = ":meta";
const INDEX_PREFIX: &str = "report_cache:index:";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub report_definition_id: Uuid,
    pub cached_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: u64,
}

/// Serialize with object keys sorted recursively, so logically identical
/// payloads hash identically regardless of construction order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::Value::Object(sorted.into_iter().collect())
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

pub struct ReportCache {
    kv: Arc<dyn Kv>,
}

impl ReportCache {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Deterministic cache key for one report request.
    pub fn fingerprint(
        report_definition_id: Uuid,
        query_parameters: &serde_json::Value,
        date_range: Option<&DateRange>,
    ) -> String {
        let payload = serde_json::json!({
            "report_definition_id": report_definition_id,
            "query_parameters": query_parameters,
            "date_range": date_range,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&payload).as_bytes());
        hex::encode(hasher.finalize())
    }

    fn value_key(fingerprint: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{fingerprint}")
    }

    fn meta_key(fingerprint: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{fingerprint}{METADATA_SUFFIX}")
    }

    fn index_key(report_definition_id: Uuid) -> String {
        format!("{INDEX_PREFIX}{report_definition_id}")
    }

    /// Fetch a cached artifact. Misses when either entry is absent or the
    /// backend fails.
    pub async fn get(
        &self,
        report_definition_id: Uuid,
        query_parameters: &serde_json::Value,
        date_range: Option<&DateRange>,
    ) -> Option<(Vec<u8>, CacheMetadata)> {
        let fp = Self::fingerprint(report_definition_id, query_parameters, date_range);
        let bytes = match self.kv.get(&Self::value_key(&fp)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(fingerprint = %fp, "cache miss");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        let metadata = match self.kv.get(&Self::meta_key(&fp)).await {
            Ok(Some(raw)) => serde_json::from_slice::<CacheMetadata>(&raw).ok()?,
            _ => return None,
        };
        tracing::info!(
            report_definition_id = %report_definition_id,
            fingerprint = %fp,
            size_bytes = bytes.len(),
            "cache hit"
        );
        Some((bytes, metadata))
    }

    /// Store an artifact and its metadata under one TTL. Returns whether the
    /// write succeeded.
    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        report_definition_id: Uuid,
        query_parameters: &serde_json::Value,
        date_range: Option<&DateRange>,
        bytes: Vec<u8>,
        ttl_seconds: u64,
        execution_run_id: Option<Uuid>,
        report_name: Option<String>,
    ) -> bool {
        let fp = Self::fingerprint(report_definition_id, query_parameters, date_range);
        let ttl = if ttl_seconds > 0 {
            ttl_seconds
        } else {
            DEFAULT_TTL_SECONDS
        };
        let metadata = CacheMetadata {
            report_definition_id,
            cached_at: Utc::now(),
            size_bytes: bytes.len() as u64,
            ttl_seconds: ttl,
            execution_run_id,
            report_name,
        };
        let meta_raw = match serde_json::to_vec(&metadata) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "cache metadata serialization failed");
                return false;
            }
        };
        let ttl = Duration::from_secs(ttl);
        let size = bytes.len();
        let write = async {
            self.kv.set(&Self::value_key(&fp), bytes, Some(ttl)).await?;
            self.kv.set(&Self::meta_key(&fp), meta_raw, Some(ttl)).await?;
            self.add_to_index(report_definition_id, &fp).await
        };
        match write.await {
            Ok(()) => {
                tracing::info!(
                    report_definition_id = %report_definition_id,
                    fingerprint = %fp,
                    size_bytes = size,
                    ttl_seconds = ttl.as_secs(),
                    "cached report"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "cache write failed");
                false
            }
        }
    }

    async fn add_to_index(
        &self,
        report_definition_id: Uuid,
        fingerprint: &str,
    ) -> Result<(), crate::kv::KvError> {
        let key = Self::index_key(report_definition_id);
        let mut fingerprints: Vec<String> = match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        if !fingerprints.iter().any(|f| f == fingerprint) {
            fingerprints.push(fingerprint.to_string());
            let raw = serde_json::to_vec(&fingerprints).unwrap_or_default();
            self.kv.set(&key, raw, None).await?;
        }
        Ok(())
    }

    /// Drop one cached request. Returns whether anything existed.
    pub async fn invalidate(
        &self,
        report_definition_id: Uuid,
        query_parameters: &serde_json::Value,
        date_range: Option<&DateRange>,
    ) -> bool {
        let fp = Self::fingerprint(report_definition_id, query_parameters, date_range);
        let existed = self.kv.remove(&Self::value_key(&fp)).await.unwrap_or(false);
        let _ = self.kv.remove(&Self::meta_key(&fp)).await;
        tracing::info!(
            report_definition_id = %report_definition_id,
            fingerprint = %fp,
            existed,
            "invalidated cache entry"
        );
        existed
    }

    /// Drop every cached request for a report definition. Returns the number
    /// of entries removed.
    pub async fn invalidate_all(&self, report_definition_id: Uuid) -> usize {
        let key = Self::index_key(report_definition_id);
        let fingerprints: Vec<String> = match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_default(),
            _ => Vec::new(),
        };
        let mut removed = 0;
        for fp in &fingerprints {
            if self.kv.remove(&Self::value_key(fp)).await.unwrap_or(false) {
                removed += 1;
            }
            let _ = self.kv.remove(&Self::meta_key(fp)).await;
        }
        let _ = self.kv.remove(&key).await;
        tracing::info!(
            report_definition_id = %report_definition_id,
            removed,
            "invalidated all cache entries for report"
        );
        removed
    }

    /// Count and total size of cached artifacts.
    pub async fn stats(&self) -> CacheStats {
        let keys = match self.kv.keys_with_prefix(CACHE_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "cache stats scan failed");
                return CacheStats::default();
            }
        };
        let mut stats = CacheStats::default();
        for key in keys {
            if key.ends_with(METADATA_SUFFIX) || key.starts_with(INDEX_PREFIX) {
                continue;
            }
            if let Ok(Some(bytes)) = self.kv.get(&key).await {
                stats.count += 1;
                stats.total_bytes += bytes.len() as u64;
            }
        }
        stats
    }
}
