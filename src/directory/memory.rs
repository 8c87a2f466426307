//! In-memory `Directory` test double (A.6 / A.4). Mirrors Redis semantics
//! closely enough for integration tests (§8 scenarios) without a live
//! service, the way the teacher's plugin tests and the pack's fakes avoid
//! hitting real infra.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{Directory, LockOutcome, TabSelectStrategy};
use crate::error::GatewayResult;

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn fresh(value: T, ttl_secs: i64) -> Self {
        Self {
            value,
            expires_at: if ttl_secs > 0 {
                Some(Instant::now() + Duration::from_secs(ttl_secs as u64))
            } else {
                None
            },
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Instant::now() >= t)
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    strings: DashMap<String, Expiring<String>>,
    hashes: DashMap<String, Expiring<HashMap<String, String>>>,
    zsets: DashMap<String, Vec<(String, f64)>>,
    // Serializes the tab-reservation critical section, mirroring the
    // atomicity a real Lua script gives us against a single Redis instance.
    tab_lock: Mutex<()>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_string(&self, key: &str) {
        if self.strings.get(key).is_some_and(|e| e.is_expired()) {
            self.strings.remove(key);
        }
    }

    fn sweep_hash(&self, key: &str) {
        if self.hashes.get(key).is_some_and(|e| e.is_expired()) {
            self.hashes.remove(key);
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_string(&self, key: &str) -> GatewayResult<Option<String>> {
        self.sweep_string(key);
        Ok(self.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<()> {
        self.strings
            .insert(key.to_string(), Expiring::fresh(value.to_string(), ttl_secs));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<LockOutcome> {
        self.sweep_string(key);
        if self.strings.contains_key(key) {
            return Ok(LockOutcome::AlreadyHeld);
        }
        self.strings
            .insert(key.to_string(), Expiring::fresh(value.to_string(), ttl_secs));
        Ok(LockOutcome::Acquired)
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.zsets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> GatewayResult<bool> {
        self.sweep_string(key);
        self.sweep_hash(key);
        Ok(self.strings.contains_key(key) || self.hashes.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> GatewayResult<()> {
        if let Some(mut e) = self.strings.get_mut(key) {
            e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64));
        }
        if let Some(mut e) = self.hashes.get_mut(key) {
            e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64));
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .strings
            .iter()
            .map(|kv| kv.key().clone())
            .filter(|k| k.starts_with(prefix) && !self.strings.get(k).unwrap().is_expired())
            .collect();
        keys.extend(
            self.hashes
                .iter()
                .map(|kv| kv.key().clone())
                .filter(|k| k.starts_with(prefix) && !self.hashes.get(k).unwrap().is_expired()),
        );
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> GatewayResult<Vec<(String, String)>> {
        self.sweep_hash(key);
        Ok(self
            .hashes
            .get(key)
            .map(|e| e.value.clone().into_iter().collect())
            .unwrap_or_default())
    }

    async fn hash_get(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        self.sweep_hash(key);
        Ok(self
            .hashes
            .get(key)
            .and_then(|e| e.value.get(field).cloned()))
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: i64,
    ) -> GatewayResult<()> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::fresh(HashMap::new(), 0));
        for (f, v) in fields {
            entry.value.insert(f.clone(), v.clone());
        }
        if ttl_secs > 0 {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs as u64));
        }
        Ok(())
    }

    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::fresh(HashMap::new(), 0));
        entry.value.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> GatewayResult<()> {
        let mut set = self.zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        Ok(())
    }

    async fn zpopmin_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> GatewayResult<Vec<(String, f64)>> {
        let mut set = self.zsets.entry(key.to_string()).or_default();
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let take = set
            .iter()
            .take_while(|(_, score)| *score <= max_score)
            .take(limit)
            .count();
        let popped: Vec<(String, f64)> = set.drain(0..take).collect();
        Ok(popped)
    }

    async fn select_and_reserve_tab(
        &self,
        rs_ids: &[String],
        capacities: &[u32],
        strategy: TabSelectStrategy,
        request_id: &str,
        reservation_ttl_secs: i64,
    ) -> GatewayResult<Option<(String, u32)>> {
        let _guard = self.tab_lock.lock().await;

        let mut best: Option<(usize, u32, u32, f64)> = None; // (candidate idx, field, empty_count, load_ratio)

        for (i, (id, capacity)) in rs_ids.iter().zip(capacities.iter()).enumerate() {
            if *capacity == 0 {
                continue;
            }
            let key = format!("tabs:{id}");
            self.sweep_hash(&key);
            let occupied_fields: std::collections::HashSet<u32> = self
                .hashes
                .get(&key)
                .map(|e| {
                    e.value
                        .iter()
                        .filter(|(_, v)| !v.is_empty())
                        .filter_map(|(k, _)| k.parse::<u32>().ok())
                        .collect()
                })
                .unwrap_or_default();

            let free_field = (0..*capacity).find(|t| !occupied_fields.contains(t));
            let Some(field) = free_field else { continue };

            let occupied = occupied_fields.len() as u32;
            let empty_count = capacity - occupied;
            let load_ratio = occupied as f64 / *capacity as f64;

            let better = match (strategy, &best) {
                (_, None) => true,
                (TabSelectStrategy::RoundRobin, Some(_)) => false,
                (TabSelectStrategy::MostAvailable, Some((_, _, best_empty, _))) => {
                    empty_count > *best_empty
                }
                (TabSelectStrategy::LeastLoaded, Some((_, _, _, best_ratio))) => {
                    load_ratio < *best_ratio
                }
            };

            if better {
                best = Some((i, field, empty_count, load_ratio));
            }
        }

        let Some((idx, field, _, _)) = best else {
            return Ok(None);
        };
        let rs_id = rs_ids[idx].clone();
        self.hash_set_field(&format!("tabs:{rs_id}"), &field.to_string(), request_id)
            .await?;
        self.expire(&format!("tabs:{rs_id}"), reservation_ttl_secs).await?;
        Ok(Some((rs_id, field)))
    }

    async fn release_tab(&self, rs_id: &str, tab_index: u32) -> GatewayResult<()> {
        self.hash_set_field(&format!("tabs:{rs_id}"), &tab_index.to_string(), "")
            .await
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_mutually_exclusive() {
        let dir = MemoryDirectory::new();
        assert_eq!(
            dir.set_nx("lock:x", "owner-1", 10).await.unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            dir.set_nx("lock:x", "owner-2", 10).await.unwrap(),
            LockOutcome::AlreadyHeld
        );
    }

    #[tokio::test]
    async fn tab_reservation_picks_least_loaded_and_is_atomic_per_candidate() {
        let dir = MemoryDirectory::new();
        dir.hash_set_field("tabs:rs-1", "0", "existing-request").await.unwrap();

        let rs_ids = vec!["rs-1".to_string(), "rs-2".to_string()];
        let capacities = vec![2, 2];

        let chosen = dir
            .select_and_reserve_tab(
                &rs_ids,
                &capacities,
                TabSelectStrategy::LeastLoaded,
                "req-1",
                2,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(chosen.0, "rs-2");
    }

    #[tokio::test]
    async fn zpopmin_respects_score_ceiling_and_limit() {
        let dir = MemoryDirectory::new();
        dir.zadd("recache:1:high", "a", 10.0).await.unwrap();
        dir.zadd("recache:1:high", "b", 20.0).await.unwrap();
        dir.zadd("recache:1:high", "c", 5.0).await.unwrap();

        let popped = dir.zpopmin_below("recache:1:high", 15.0, 10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].0, "c");
        assert_eq!(popped[1].0, "a");
    }
}
