//! Distributed key-value collaborator — the store behind the scan lock, the
//! burst-protection counters, and the result cache.
//!
//! The trait mirrors the small slice of a Redis-shaped API this platform
//! uses. `MemoryKv` is the in-process backend for dev mode and tests; a
//! networked backend binds behind the same trait at deployment time.
//! Counters are stored as ASCII integers so `get` and `incr` compose.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),

    #[error("kv value is not an integer: {0}")]
    NotAnInteger(String),
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Set a value, optionally with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Atomic set-if-absent with TTL. Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<bool, KvError>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, KvError>;

    /// Increment an integer value (missing key counts as 0).
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Decrement an integer value, clamped at zero.
    async fn decr_clamped(&self, key: &str) -> Result<i64, KvError>;

    /// Refresh a key's TTL. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// All live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a live entry, dropping it if expired.
    fn live_value(map: &mut HashMap<String, Entry>, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match map.get(key) {
            Some(e) if e.is_live(now) => Some(e.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn parse_int(value: &[u8]) -> Result<i64, KvError> {
        let text = std::str::from_utf8(value)
            .map_err(|_| KvError::NotAnInteger("non-utf8".to_string()))?;
        text.parse::<i64>()
            .map_err(|_| KvError::NotAnInteger(text.to_string()))
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut map = self.inner.lock();
        Ok(Self::live_value(&mut map, key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut map = self.inner.lock();
        if Self::live_value(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.inner.lock();
        let existed = Self::live_value(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut map = self.inner.lock();
        let current = match Self::live_value(&mut map, key) {
            Some(v) => Self::parse_int(&v)?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr_clamped(&self, key: &str) -> Result<i64, KvError> {
        let mut map = self.inner.lock();
        let current = match Self::live_value(&mut map, key) {
            Some(v) => Self::parse_int(&v)?,
            None => 0,
        };
        let next = (current - 1).max(0);
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut map = self.inner.lock();
        if Self::live_value(&mut map, key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let map = self.inner.lock();
        let now = Instant::now();
        Ok(map
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("lock", b"a".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_if_absent("lock", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn set_if_absent_succeeds_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("lock", b"a".to_vec(), Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv
            .set_if_absent("lock", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn incr_and_decr_clamped() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("n").await.unwrap(), 1);
        assert_eq!(kv.incr("n").await.unwrap(), 2);
        assert_eq!(kv.decr_clamped("n").await.unwrap(), 1);
        assert_eq!(kv.decr_clamped("n").await.unwrap(), 0);
        assert_eq!(kv.decr_clamped("n").await.unwrap(), 0, "clamped at zero");
        assert_eq!(kv.decr_clamped("absent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incr_preserves_ttl() {
        let kv = MemoryKv::new();
        kv.set("n", b"5".to_vec(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(kv.incr("n").await.unwrap(), 6);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kv.get("n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(kv.remove("k").await.unwrap());
        assert!(!kv.remove("k").await.unwrap());
    }

    #[tokio::test]
    async fn keys_with_prefix_skips_expired() {
        let kv = MemoryKv::new();
        kv.set("cache:a", b"1".to_vec(), None).await.unwrap();
        kv.set("cache:b", b"2".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        kv.set("other:c", b"3".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let keys = kv.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:a".to_string()]);
    }

    #[tokio::test]
    async fn expire_refreshes_ttl() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.get("k").await.unwrap().is_some());
        assert!(!kv.expire("missing", Duration::from_secs(1)).await.unwrap());
    }
}
