//! Shared directory client (C1 / A.6): the key-value, hash, sorted-set and
//! atomic-script primitives every other component is built on.
//!
//! One async trait, two implementations — `RedisDirectory` against a live
//! Redis, and `MemoryDirectory` as the in-memory test double — following the
//! pack's "one concrete backend plus an in-memory double" capability-set
//! pattern (`other_examples` `distributed_cache.rs` `CacheBackend`).

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::error::GatewayResult;

/// Outcome of a `set_nx`-style lock attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    AlreadyHeld,
}

/// Narrow operation set the rest of the gateway depends on; no component
/// reaches into a Redis/etcd-specific type directly.
#[async_trait]
pub trait Directory: Send + Sync {
    // --- plain string keys (registry, locks, debug handles) ---
    async fn get_string(&self, key: &str) -> GatewayResult<Option<String>>;
    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<()>;
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<LockOutcome>;
    async fn delete(&self, key: &str) -> GatewayResult<()>;
    async fn exists(&self, key: &str) -> GatewayResult<bool>;
    async fn expire(&self, key: &str, ttl_secs: i64) -> GatewayResult<()>;
    /// Enumerate keys matching a `prefix*` glob. Used for registry scans (C7,
    /// C11); bounded by the directory's own key cardinality, never per-request
    /// hot-path size.
    async fn scan_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>>;

    // --- hash-per-key (CacheMetadata, TabHash) ---
    async fn hash_get_all(&self, key: &str) -> GatewayResult<Vec<(String, String)>>;
    async fn hash_get(&self, key: &str, field: &str) -> GatewayResult<Option<String>>;
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: i64,
    ) -> GatewayResult<()>;
    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> GatewayResult<()>;

    // --- sorted sets (recache priority queues) ---
    async fn zadd(&self, key: &str, member: &str, score: f64) -> GatewayResult<()>;
    /// Pop up to `limit` lowest-score members with score ≤ `max_score`.
    async fn zpopmin_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> GatewayResult<Vec<(String, f64)>>;

    /// Atomic tab-reservation script (C11). `rs_ids` is the candidate service
    /// ids already filtered to healthy/capacity>0 by the caller (reading
    /// `service:render:*` requires a directory scan, done before the call);
    /// the script itself only touches `tabs:{id}` hashes atomically.
    async fn select_and_reserve_tab(
        &self,
        rs_ids: &[String],
        capacities: &[u32],
        strategy: TabSelectStrategy,
        request_id: &str,
        reservation_ttl_secs: i64,
    ) -> GatewayResult<Option<(String, u32)>>;

    async fn release_tab(&self, rs_id: &str, tab_index: u32) -> GatewayResult<()>;

    async fn ping(&self) -> GatewayResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TabSelectStrategy {
    LeastLoaded,
    MostAvailable,
    RoundRobin,
}

impl TabSelectStrategy {
    pub fn as_script_arg(&self) -> &'static str {
        match self {
            TabSelectStrategy::LeastLoaded => "least_loaded",
            TabSelectStrategy::MostAvailable => "most_available",
            TabSelectStrategy::RoundRobin => "round_robin",
        }
    }
}
