//! Two-tier response cache.
//!
//! Tier one is a process-local map: fast, volatile, may vanish on restart.
//! Tier two is Redis: durable within its TTL, shared across instances, and
//! the source of truth for cache correctness; the local tier is pure
//! latency optimization. Reads check local then remote (populating local on
//! a remote hit); writes populate both. Remote failures degrade to a miss
//! and are logged, never propagated to the caller.

pub mod key;
pub mod policy;

use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use crate::errors::AppError;

use key::{cache_key, method_scope_prefix, scope_scan_pattern};
use policy::{invalidated_by, ttl_for};

/// A cached response. Never mutated in place; invalidation deletes it.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
    /// Scope identifier, used for bulk invalidation.
    tag: String,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration, tag: String) -> Self {
        let now = Utc::now();
        let size_bytes = value.to_string().len();
        Self {
            value,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            size_bytes,
            tag,
        }
    }

    fn remaining_ttl(&self) -> Option<u64> {
        let remaining = self.expires_at - Utc::now();
        (remaining > chrono::Duration::zero()).then(|| remaining.num_seconds().max(0) as u64)
    }
}

/// Result of a cache-wrapped handler execution. The hit flag and remaining
/// TTL are surfaced to the transport as headers, never mixed into the
/// payload's business fields.
#[derive(Debug)]
pub struct CacheOutcome {
    pub value: Value,
    pub hit: bool,
    pub remaining_ttl: Option<u64>,
}

/// Two-tier cache wrapping handler execution with get-or-compute-and-store
/// semantics plus invalidation by method or by scope.
pub struct CacheService {
    local: RwLock<HashMap<String, CacheEntry>>,
    remote: Option<ConnectionManager>,
}

impl CacheService {
    pub fn new(remote: ConnectionManager) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: Some(remote),
        }
    }

    /// Local-tier-only cache, for tests and single-instance deployments
    /// without a Redis endpoint.
    pub fn in_memory() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: None,
        }
    }

    /// Runs `compute` through the cache. Non-cacheable methods always call
    /// `compute`; errors are never stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        method: &str,
        scope_id: &str,
        params: &Map<String, Value>,
        compute: F,
    ) -> Result<CacheOutcome, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, AppError>>,
    {
        let Some(ttl) = ttl_for(method) else {
            let value = compute().await?;
            return Ok(CacheOutcome {
                value,
                hit: false,
                remaining_ttl: None,
            });
        };

        let key = cache_key(method, scope_id, params);

        if let Some(entry) = self.local_get(&key) {
            return Ok(CacheOutcome {
                remaining_ttl: entry.remaining_ttl(),
                value: entry.value,
                hit: true,
            });
        }

        if let Some(value) = self.remote_get(&key).await {
            let entry = CacheEntry::new(value.clone(), ttl, scope_id.to_string());
            let remaining_ttl = entry.remaining_ttl();
            self.local_put(&key, entry);
            return Ok(CacheOutcome {
                value,
                hit: true,
                remaining_ttl,
            });
        }

        let value = compute().await?;
        self.local_put(
            &key,
            CacheEntry::new(value.clone(), ttl, scope_id.to_string()),
        );
        self.remote_put(&key, &value, ttl).await;
        Ok(CacheOutcome {
            value,
            hit: false,
            remaining_ttl: Some(ttl.as_secs()),
        })
    }

    /// Deletes every cached entry, across all parameter sets, for each read
    /// method the given mutation can stale within the scope.
    pub async fn invalidate(&self, mutation_method: &str, scope_id: &str) {
        for read_method in invalidated_by(mutation_method) {
            let prefix = method_scope_prefix(read_method, scope_id);
            self.local_remove_prefix(&prefix);
            self.remote_remove_pattern(&format!("{prefix}*")).await;
        }
    }

    /// Removes every cached entry for a scope regardless of method, for
    /// destructive operations on the whole scope.
    pub async fn invalidate_scope(&self, scope_id: &str) {
        if let Ok(mut local) = self.local.write() {
            local.retain(|_, entry| entry.tag != scope_id);
        }
        self.remote_remove_pattern(&scope_scan_pattern(scope_id))
            .await;
    }

    // ── local tier ──────────────────────────────────────────────────────

    fn local_get(&self, key: &str) -> Option<CacheEntry> {
        let expired = {
            let local = self.local.read().ok()?;
            match local.get(key) {
                Some(entry) if entry.expires_at > Utc::now() => return Some(entry.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            if let Ok(mut local) = self.local.write() {
                local.remove(key);
            }
        }
        None
    }

    fn local_put(&self, key: &str, entry: CacheEntry) {
        tracing::debug!(
            "cache store key={key} size={}B ttl_until={}",
            entry.size_bytes,
            entry.expires_at
        );
        if let Ok(mut local) = self.local.write() {
            local.insert(key.to_string(), entry);
        }
    }

    fn local_remove_prefix(&self, prefix: &str) {
        if let Ok(mut local) = self.local.write() {
            local.retain(|key, _| !key.starts_with(prefix));
        }
    }

    // ── remote tier (best-effort) ───────────────────────────────────────

    async fn remote_get(&self, key: &str) -> Option<Value> {
        let mut conn = self.remote.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("remote cache get failed for {key}: {e}");
                None
            }
        }
    }

    async fn remote_put(&self, key: &str, value: &Value, ttl: Duration) {
        let Some(mut conn) = self.remote.clone() else {
            return;
        };
        let raw = value.to_string();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, raw, ttl.as_secs())
            .await
        {
            tracing::warn!("remote cache set failed for {key}: {e}");
        }
    }

    async fn remote_remove_pattern(&self, pattern: &str) {
        let Some(mut conn) = self.remote.clone() else {
            return;
        };
        let keys: Vec<String> = {
            let mut iter = match conn.scan_match::<_, String>(pattern).await {
                Ok(iter) => iter,
                Err(e) => {
                    tracing::warn!("remote cache scan failed for {pattern}: {e}");
                    return;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return;
        }
        if let Err(e) = conn.del::<_, ()>(keys).await {
            tracing::warn!("remote cache delete failed for {pattern}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    async fn call_counted(
        cache: &CacheService,
        method: &str,
        scope: &str,
        params: Map<String, Value>,
        calls: &AtomicU32,
    ) -> CacheOutcome {
        cache
            .get_or_compute(method, scope, &params, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"projects": ["a", "b"]}))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_non_cacheable_method_always_computes() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);
        let params = obj(json!({ "a": 1 }));

        call_counted(&cache, "create_project", "s1", params.clone(), &calls).await;
        call_counted(&cache, "create_project", "s1", params, &calls).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cacheable_method_hits_on_reordered_params() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);

        let first = call_counted(&cache, "list_projects", "s1", obj(json!({"a":1,"b":2})), &calls).await;
        let second =
            call_counted(&cache, "list_projects", "s1", obj(json!({"b":2,"a":1})), &calls).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.hit);
        assert!(second.hit);
        assert_eq!(first.value, second.value);
        assert!(second.remaining_ttl.unwrap() <= 1800);
    }

    #[tokio::test]
    async fn test_errors_are_never_cached() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);
        let params = obj(json!({}));

        let result = cache
            .get_or_compute("list_projects", "s1", &params, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(AppError::Upstream("store down".into()))
            })
            .await;
        assert!(result.is_err());

        // the failed result must not satisfy the next call
        let outcome = call_counted(&cache, "list_projects", "s1", params, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!outcome.hit);
    }

    #[tokio::test]
    async fn test_invalidation_fan_out() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);
        let params = obj(json!({}));

        call_counted(&cache, "list_projects", "s1", params.clone(), &calls).await;
        call_counted(&cache, "list_skills", "s1", params.clone(), &calls).await;
        call_counted(&cache, "list_projects", "s2", params.clone(), &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.invalidate("create_project", "s1").await;

        // list_projects@s1 was staled; skills and the other scope were not
        let outcome = call_counted(&cache, "list_projects", "s1", params.clone(), &calls).await;
        assert!(!outcome.hit);
        let outcome = call_counted(&cache, "list_skills", "s1", params.clone(), &calls).await;
        assert!(outcome.hit);
        let outcome = call_counted(&cache, "list_projects", "s2", params, &calls).await;
        assert!(outcome.hit);
    }

    #[tokio::test]
    async fn test_invalidate_scope_removes_all_methods() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);
        let params = obj(json!({}));

        call_counted(&cache, "list_projects", "s1", params.clone(), &calls).await;
        call_counted(&cache, "list_skills", "s1", params.clone(), &calls).await;
        call_counted(&cache, "list_projects", "s2", params.clone(), &calls).await;

        cache.invalidate_scope("s1").await;

        assert!(!call_counted(&cache, "list_projects", "s1", params.clone(), &calls).await.hit);
        assert!(!call_counted(&cache, "list_skills", "s1", params.clone(), &calls).await.hit);
        assert!(call_counted(&cache, "list_projects", "s2", params, &calls).await.hit);
    }

    #[tokio::test]
    async fn test_unrelated_mutation_invalidates_nothing() {
        let cache = CacheService::in_memory();
        let calls = AtomicU32::new(0);
        let params = obj(json!({}));

        call_counted(&cache, "list_projects", "s1", params.clone(), &calls).await;
        cache.invalidate("create_skill", "s1").await;
        assert!(call_counted(&cache, "list_projects", "s1", params, &calls).await.hit);
    }
}
