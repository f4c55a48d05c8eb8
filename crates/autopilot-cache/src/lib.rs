//! Response caching for LLM calls.
//!
//! Two layers: an exact-match cache keyed by a SHA-256 of the canonical
//! request, and a semantic layer that matches prompts by cosine similarity.
//! Concurrent misses on the same exact key are coalesced so the provider is
//! called once. Cache writes are best-effort; a failed write logs a warning
//! and the freshly computed value is returned anyway.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

mod semantic;

pub use semantic::{cosine_similarity, Embedder, HashEmbedder, MemorySemanticIndex, SemanticIndex};

/// Build the exact cache key. Canonical JSON (sorted object keys) over the
/// request identity, hashed, and prefixed with the tenant so invalidation
/// can scan by prefix. Temperature is bucketed to one decimal so float noise
/// does not defeat the cache.
pub fn exact_key(
    prompt: &str,
    system: Option<&str>,
    model: &str,
    temperature: f32,
    tenant_id: &str,
) -> String {
    let bucket = (temperature * 10.0).round() as i32;
    // serde_json::json! with a Map keeps insertion order; build the canonical
    // form by hand so key order is fixed.
    let canonical = format!(
        "{{\"model\":{},\"prompt\":{},\"system\":{},\"temperature_bucket\":{},\"tenant\":{}}}",
        serde_json::to_string(model).unwrap_or_default(),
        serde_json::to_string(prompt).unwrap_or_default(),
        serde_json::to_string(system.unwrap_or("")).unwrap_or_default(),
        bucket,
        serde_json::to_string(tenant_id).unwrap_or_default(),
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("rc:{}:{:064x}", tenant_id, hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub value: String,
    /// True when the value was replayed (stored hit or coalesced wait)
    /// instead of computed by this caller.
    pub cached: bool,
}

struct Entry {
    value: String,
    created: Instant,
    accessed: Instant,
}

type InflightSender = broadcast::Sender<Result<String, String>>;

/// In-process exact-match layer. Bounded LRU with TTL.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, Entry>>,
    inflight: Mutex<HashMap<String, InflightSender>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl_s: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_s),
            max_entries,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.entries.lock().await;
        let entry = guard.get_mut(key)?;
        if entry.created.elapsed() >= self.ttl {
            guard.remove(key);
            return None;
        }
        entry.accessed = Instant::now();
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: &str, value: &str) {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();
        guard.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                created: now,
                accessed: now,
            },
        );

        // Drop expired entries, then least-recently-used down to the bound.
        let ttl = self.ttl;
        guard.retain(|_, entry| entry.created.elapsed() < ttl);
        while guard.len() > self.max_entries {
            let Some(oldest) = guard
                .iter()
                .min_by_key(|(_, entry)| entry.accessed)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            guard.remove(&oldest);
        }
    }

    /// Exact-key read-through with single-flight coalescing: at most one
    /// in-flight compute per key; concurrent misses wait for and share the
    /// first result. Compute errors propagate to every waiter and are not
    /// cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<CacheOutcome, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        if let Some(value) = self.get(key).await {
            info!(key, "cache_hit");
            return Ok(CacheOutcome {
                value,
                cached: true,
            });
        }

        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            // Re-check under the inflight lock: a concurrent compute may have
            // completed between the cache read and here.
            if let Some(value) = self.get(key).await {
                return Ok(CacheOutcome {
                    value,
                    cached: true,
                });
            }
            match inflight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(rx) = receiver.as_mut() {
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(CacheOutcome {
                    value,
                    cached: true,
                }),
                Ok(Err(err)) => Err(err),
                // Sender dropped without a result; treat as a provider fault.
                Err(_) => Err("coalesced compute was abandoned".to_string()),
            };
        }

        let result = compute().await;

        if let Ok(value) = &result {
            self.put(key, value).await;
        }

        let sender = self.inflight.lock().await.remove(key);
        if let Some(sender) = sender {
            let _ = sender.send(result.clone());
        }

        result.map(|value| CacheOutcome {
            value,
            cached: false,
        })
    }

    /// Remove keys matching a glob prefix (`rc:tenant-1:*`). The scan is
    /// bounded to 1000 keys per invocation; callers loop if they need more.
    pub async fn invalidate_prefix(&self, pattern: &str) -> usize {
        let prefix = pattern.trim_end_matches('*');
        let mut guard = self.entries.lock().await;
        let matching: Vec<String> = guard
            .keys()
            .take(1000)
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let count = matching.len();
        for key in matching {
            guard.remove(&key);
        }
        if count > 0 {
            info!(pattern, count, "cache_invalidated");
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Best-effort write used by callers that computed outside
    /// `get_or_compute`; logs instead of failing.
    pub async fn put_best_effort(&self, key: &str, value: &str) {
        if key.is_empty() {
            warn!("cache_set_error: empty key");
            return;
        }
        self.put(key, value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn exact_key_is_deterministic_and_tenant_prefixed() {
        let a = exact_key("book a haircut", Some("sys"), "m-1", 0.7, "t-1");
        let b = exact_key("book a haircut", Some("sys"), "m-1", 0.7, "t-1");
        assert_eq!(a, b);
        assert!(a.starts_with("rc:t-1:"));
    }

    #[test]
    fn exact_key_varies_by_every_component() {
        let base = exact_key("p", Some("s"), "m", 0.7, "t");
        assert_ne!(base, exact_key("q", Some("s"), "m", 0.7, "t"));
        assert_ne!(base, exact_key("p", Some("x"), "m", 0.7, "t"));
        assert_ne!(base, exact_key("p", Some("s"), "n", 0.7, "t"));
        assert_ne!(base, exact_key("p", Some("s"), "m", 0.2, "t"));
        assert_ne!(base, exact_key("p", Some("s"), "m", 0.7, "u"));
    }

    #[test]
    fn temperature_buckets_absorb_float_noise() {
        let a = exact_key("p", None, "m", 0.70001, "t");
        let b = exact_key("p", None, "m", 0.7, "t");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn serial_hits_replay_identical_content() {
        let cache = ResponseCache::new(3600, 100);
        let key = exact_key("p", None, "m", 0.7, "t");

        let first = cache
            .get_or_compute(&key, || async { Ok("answer".to_string()) })
            .await
            .unwrap();
        assert!(!first.cached);

        let second = cache
            .get_or_compute(&key, || async {
                Err::<String, String>("second call must not compute".into())
            })
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = ResponseCache::new(0, 100);
        cache.put("k", "v").await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn lru_eviction_respects_bound() {
        let cache = ResponseCache::new(3600, 3);
        for i in 0..6 {
            cache.put(&format!("k{i}"), "v").await;
        }
        assert!(cache.len().await <= 3);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_compute() {
        let cache = Arc::new(ResponseCache::new(3600, 100));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = exact_key("p", None, "m", 0.7, "t");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("shared".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut computed = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.value, "shared");
            if !outcome.cached {
                computed += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "provider called once");
        assert_eq!(computed, 1);
    }

    #[tokio::test]
    async fn compute_errors_reach_waiters_and_are_not_cached() {
        let cache = ResponseCache::new(3600, 100);
        let key = exact_key("p", None, "m", 0.7, "t");
        let err = cache
            .get_or_compute(&key, || async { Err::<String, _>("provider down".into()) })
            .await
            .unwrap_err();
        assert_eq!(err, "provider down");
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn prefix_invalidation_is_tenant_scoped() {
        let cache = ResponseCache::new(3600, 100);
        cache.put(&exact_key("p1", None, "m", 0.7, "t-1"), "a").await;
        cache.put(&exact_key("p2", None, "m", 0.7, "t-1"), "b").await;
        cache.put(&exact_key("p1", None, "m", 0.7, "t-2"), "c").await;

        let removed = cache.invalidate_prefix("rc:t-1:*").await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
    }
}
