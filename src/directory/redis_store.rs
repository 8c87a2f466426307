//! Redis-backed `Directory` implementation. Connection pooling is Redis'
//! `connection-manager` (auto-reconnect, one shared multiplexed connection
//! per process) — the same "hold one managed client, clone cheaply" idiom
//! the teacher used for its etcd client (`config/etcd.rs` `get_client`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{Directory, LockOutcome, TabSelectStrategy};
use crate::error::GatewayResult;

/// Lua script for C11's atomic tab reservation. KEYS are `tabs:{id}` hash
/// keys for the already-health-filtered candidate set; ARGV carries the
/// strategy, the reserving request id, the reservation TTL, then one
/// capacity integer per KEY, in the same order. Returns `{-1, -1}` when no
/// candidate has a free tab, else `{candidate_index, tab_index}` (1-based
/// candidate_index to match Lua's array convention).
const SELECT_AND_RESERVE_TAB: &str = r#"
local n = #KEYS
local strategy = ARGV[1]
local request_id = ARGV[2]
local ttl = tonumber(ARGV[3])

local best_idx = -1
local best_field = -1
local best_empty_count = -1
local best_load_ratio = nil

for i = 1, n do
    local key = KEYS[i]
    local capacity = tonumber(ARGV[3 + i])
    if capacity and capacity > 0 then
        local fields = redis.call('HGETALL', key)
        local occ = {}
        local occupied = 0
        for j = 1, #fields, 2 do
            local fidx = tonumber(fields[j])
            local val = fields[j + 1]
            if val ~= '' and val ~= false then
                occ[fidx] = true
                occupied = occupied + 1
            end
        end

        local free = -1
        for t = 0, capacity - 1 do
            if not occ[t] then
                free = t
                break
            end
        end

        if free >= 0 then
            local empty_count = capacity - occupied
            local load_ratio = occupied / capacity
            if strategy == 'round_robin' then
                if best_idx == -1 then
                    best_idx = i
                    best_field = free
                end
            elseif strategy == 'most_available' then
                if empty_count > best_empty_count then
                    best_empty_count = empty_count
                    best_idx = i
                    best_field = free
                end
            else
                if best_load_ratio == nil or load_ratio < best_load_ratio then
                    best_load_ratio = load_ratio
                    best_idx = i
                    best_field = free
                end
            end
        end
    end
end

if best_idx == -1 then
    return {-1, -1}
end

redis.call('HSET', KEYS[best_idx], best_field, request_id)
redis.call('EXPIRE', KEYS[best_idx], ttl)
return {best_idx, best_field}
"#;

pub struct RedisDirectory {
    conn: ConnectionManager,
    select_and_reserve_tab: Script,
}

impl RedisDirectory {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            select_and_reserve_tab: Script::new(SELECT_AND_RESERVE_TAB),
        })
    }
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn get_string(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        if ttl_secs > 0 {
            let _: () = conn.set_ex(key, value, ttl_secs as u64).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: i64) -> GatewayResult<LockOutcome> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_secs.max(1) as usize));
        let result: Option<String> = conn.set_options(key, value, opts).await?;
        Ok(if result.is_some() {
            LockOutcome::Acquired
        } else {
            LockOutcome::AlreadyHeld
        })
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> GatewayResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        use futures::StreamExt;
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn hash_get_all(&self, key: &str) -> GatewayResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hash_get(&self, key: &str, field: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: i64,
    ) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        if !fields.is_empty() {
            let _: () = conn.hset_multiple(key, fields).await?;
        }
        if ttl_secs > 0 {
            let _: () = conn.expire(key, ttl_secs).await?;
        }
        Ok(())
    }

    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zpopmin_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> GatewayResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let candidates: Vec<(String, f64)> =
            conn.zrangebyscore_withscores(key, "-inf", max_score).await?;
        let to_pop: Vec<&(String, f64)> = candidates.iter().take(limit).collect();
        for (member, _) in &to_pop {
            let _: () = conn.zrem(key, member).await?;
        }
        Ok(to_pop.into_iter().cloned().collect())
    }

    async fn select_and_reserve_tab(
        &self,
        rs_ids: &[String],
        capacities: &[u32],
        strategy: TabSelectStrategy,
        request_id: &str,
        reservation_ttl_secs: i64,
    ) -> GatewayResult<Option<(String, u32)>> {
        if rs_ids.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.select_and_reserve_tab.prepare_invoke();
        for id in rs_ids {
            invocation.key(format!("tabs:{id}"));
        }
        invocation
            .arg(strategy.as_script_arg())
            .arg(request_id)
            .arg(reservation_ttl_secs);
        for cap in capacities {
            invocation.arg(*cap);
        }

        let (idx, field): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        if idx < 0 {
            return Ok(None);
        }
        let rs_id = rs_ids[(idx - 1) as usize].clone();
        Ok(Some((rs_id, field as u32)))
    }

    async fn release_tab(&self, rs_id: &str, tab_index: u32) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(format!("tabs:{rs_id}"), tab_index, "")
            .await?;
        Ok(())
    }

    async fn ping(&self) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
