//! Recache scheduler (C15): drains per-host `high` → `autorecache` → `normal`
//! priority queues (§4.14) against a render-service capacity budget, dispatching
//! each popped URL either to a local render or, under sharding, across the wire
//! to the owning EG — the same rendezvous-ownership decision C9's coordinator
//! already makes for cache pull/push. Built on the teacher's background-task
//! idiom (a `tokio::time::interval` tick loop spawned alongside the proxy
//! service in `main.rs`) rather than pingora's own `BackgroundService`, since
//! this worker needs a shared work queue fed by the tick loop and drained by a
//! separate pool, not a single periodic callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::cache::fs::FsCache;
use crate::cache::meta::{now_unix, CacheMetadata};
use crate::cache::{CacheKey, SourceTag};
use crate::canon;
use crate::config::RecacheConfig;
use crate::config::RuleAction;
use crate::directory::TabSelectStrategy;
use crate::error::GatewayResult;
use crate::events::EventFields;
use crate::metrics;
use crate::orchestrator::{filter_headers, path_and_query_of, GatewayState};
use crate::render_client::RenderRequest;
use crate::rs_select::SelectOutcome;
use crate::shard;

/// One queued recache job (§4.14 step 1 member schema). `internal.rs`'s
/// admin-triggered enqueue never sets `host_id` on the member — it's carried
/// by the queue key instead — so this field defaults and the key-derived
/// value is used when it's absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecacheEntry {
    pub url: String,
    #[serde(default)]
    pub host_id: u32,
    pub dimension_id: u32,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Priority {
    High,
    AutoRecache,
    Normal,
}

impl Priority {
    fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::AutoRecache => "autorecache",
            Priority::Normal => "normal",
        }
    }
}

pub struct RecacheScheduler {
    state: Arc<GatewayState>,
    config: RecacheConfig,
    self_eg_id: String,
    internal_bearer_key: String,
    http_client: reqwest::Client,
    paused: AtomicBool,
    in_flight: AtomicU64,
    sender: mpsc::Sender<RecacheEntry>,
    receiver: Mutex<Option<mpsc::Receiver<RecacheEntry>>>,
}

impl RecacheScheduler {
    pub fn new(state: Arc<GatewayState>, config: RecacheConfig, self_eg_id: String, internal_bearer_key: String) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.internal_queue_max_size.max(1));
        Arc::new(Self {
            state,
            config,
            self_eg_id,
            internal_bearer_key,
            http_client: reqwest::Client::new(),
            paused: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            sender,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Spawns the worker pool, then ticks forever. `pause`/`resume` are
    /// sampled once per tick, never mid-tick, so a pause never interrupts a
    /// drain that already started.
    pub async fn run(self: Arc<Self>) {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .expect("RecacheScheduler::run called more than once");
        let shared_receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..self.config.worker_count.max(1) {
            let me = self.clone();
            let rx = shared_receiver.clone();
            tokio::spawn(async move { me.worker_loop(worker_id, rx).await });
        }

        let normal_ticks = (self.config.normal_check_interval_ms / self.config.tick_interval_ms.max(1)).max(1);
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            if self.is_paused() {
                continue;
            }
            let check_normal = tick % normal_ticks == 0;
            tick = tick.wrapping_add(1);
            if let Err(e) = self.run_tick(check_normal).await {
                log::warn!(error:? = e; "recache tick failed");
            }
        }
    }

    async fn run_tick(&self, check_normal: bool) -> GatewayResult<()> {
        let total_capacity = self.state.rs_selector.total_capacity().await? as f64;
        let reserved = total_capacity * self.config.rs_capacity_reserved;
        let usable = (total_capacity - reserved).max(0.0) as u64;
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let budget = usable.saturating_sub(in_flight);
        if budget == 0 {
            return Ok(());
        }

        let compiled = self.state.config.load_full();
        let mut remaining = budget;
        for host in compiled.raw.hosts.iter() {
            if remaining == 0 {
                break;
            }
            remaining -= self.drain_host(host.id, Priority::High, remaining).await?;
            if remaining == 0 {
                continue;
            }
            remaining -= self.drain_host(host.id, Priority::AutoRecache, remaining).await?;
            if remaining == 0 || !check_normal {
                continue;
            }
            remaining -= self.drain_host(host.id, Priority::Normal, remaining).await?;
        }
        Ok(())
    }

    /// Pops up to `budget` due entries off one host's priority queue and
    /// enqueues them on the internal work channel. Returns the number popped.
    async fn drain_host(&self, host_id: u32, priority: Priority, budget: u64) -> GatewayResult<u64> {
        let key = format!("recache:{host_id}:{}", priority.as_str());
        let popped = self
            .state
            .directory
            .zpopmin_below(&key, now_unix() as f64, budget as usize)
            .await?;
        if popped.is_empty() {
            return Ok(0);
        }

        let host_label = host_id.to_string();
        let mut accepted = 0u64;
        for (member, _score) in popped {
            let Ok(mut entry) = serde_json::from_str::<RecacheEntry>(&member) else {
                log::warn!(host_id, member = member.as_str(); "dropping malformed recache queue member");
                continue;
            };
            if entry.host_id == 0 {
                entry.host_id = host_id;
            }
            metrics::RECACHE_SCHEDULED_TOTAL
                .with_label_values(&[&host_label, priority.as_str()])
                .inc();

            match self.sender.try_send(entry) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(entry)) => {
                    log::warn!(host_id, url = entry.url.as_str(); "recache internal queue full, dropping entry");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::error!("recache internal queue closed");
                }
            }
        }
        Ok(accepted)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<RecacheEntry>>>) {
        loop {
            let entry = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(entry) = entry else {
                log::info!(worker_id; "recache worker exiting: channel closed");
                return;
            };

            self.in_flight.fetch_add(1, Ordering::Relaxed);
            let timeout = Duration::from_millis(self.config.timeout_per_url_ms);
            let result = tokio::time::timeout(timeout, self.try_recache(&entry)).await;
            self.in_flight.fetch_sub(1, Ordering::Relaxed);

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(crate::error::GatewayError::UpstreamTimeout),
            };

            if let Err(e) = outcome {
                self.handle_failure(entry, e).await;
            }
        }
    }

    async fn handle_failure(&self, entry: RecacheEntry, err: crate::error::GatewayError) {
        let host_label = entry.host_id.to_string();
        log::warn!(host_id = entry.host_id, url = entry.url.as_str(), error:? = err; "recache attempt failed");

        if entry.attempt + 1 >= self.config.max_retries {
            metrics::RECACHE_FAILED_TOTAL.with_label_values(&[&host_label]).inc();
            return;
        }

        let next_attempt = entry.attempt + 1;
        let delay_secs = (self.config.retry_base_delay_ms as f64 * 2f64.powi(entry.attempt as i32)) / 1000.0;
        let member = serde_json::json!({
            "url": entry.url,
            "host_id": entry.host_id,
            "dimension_id": entry.dimension_id,
            "attempt": next_attempt,
        })
        .to_string();
        let score = now_unix() as f64 + delay_secs;

        if let Err(e) = self
            .state
            .directory
            .zadd(&format!("recache:{}:normal", entry.host_id), &member, score)
            .await
        {
            log::warn!(host_id = entry.host_id, error:? = e; "failed to reschedule recache entry");
            metrics::RECACHE_FAILED_TOTAL.with_label_values(&[&host_label]).inc();
        }
    }

    /// Resolves the URL against current config, decides local-vs-remote
    /// dispatch, and executes. A resolved action other than `Render` is a
    /// benign no-op — the rule changed under the entry since it was queued.
    async fn try_recache(&self, entry: &RecacheEntry) -> GatewayResult<()> {
        let compiled = self.state.config.load_full();
        let Some(host) = compiled.hosts_by_id.get(&entry.host_id) else {
            return Ok(());
        };

        let strip_patterns = compiled.strip_patterns_for(host);
        let canon_result = canon::normalize(&entry.url, &strip_patterns)?;
        let url_hash = canon::hash(&canon_result.canonical);
        let path_and_query = path_and_query_of(&canon_result.canonical);
        let resolved = compiled.resolve(host, &path_and_query)?;

        if !matches!(resolved.action, RuleAction::Render) {
            return Ok(());
        }

        let cache_key = CacheKey { host_id: entry.host_id, dimension_id: entry.dimension_id };
        let directory_key = cache_key.directory_key(&url_hash);

        if resolved.sharding_enabled {
            let healthy = self.state.cluster.get_healthy_egs().await?;
            let healthy_ids: Vec<String> = healthy.iter().map(|e| e.eg_id.clone()).collect();
            let owners = shard::owners(&directory_key, &healthy_ids, resolved.sharding_replication_factor);
            if !owners.iter().any(|id| *id == self.self_eg_id) {
                if let Some(owner) = owners.first().and_then(|id| healthy.iter().find(|e| &e.eg_id == id)) {
                    return self.dispatch_remote(owner, entry).await;
                }
                // No live owner reachable (cluster just changed membership) — fall
                // through to a local render rather than dropping the job.
            }
        }

        self.recache_locally(host.host.id, entry, &canon_result.canonical, &url_hash, &directory_key, &resolved)
            .await
    }

    async fn dispatch_remote(&self, owner: &crate::cluster::EgInfo, entry: &RecacheEntry) -> GatewayResult<()> {
        let url = format!("http://{}:{}/internal/cache/recache", owner.address, owner.port);
        let body = serde_json::json!({
            "url": entry.url,
            "host_id": entry.host_id,
            "dimension_id": entry.dimension_id,
        });
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.internal_bearer_key)
            .json(&body)
            .timeout(Duration::from_millis(self.config.timeout_per_url_ms))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    crate::error::GatewayError::UpstreamTimeout
                } else {
                    crate::error::GatewayError::UpstreamUnavailable(format!("remote recache dispatch failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(crate::error::GatewayError::UpstreamUnavailable(format!(
                "remote recache dispatch to {} returned {}",
                owner.eg_id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn recache_locally(
        &self,
        host_id: u32,
        entry: &RecacheEntry,
        canonical_url: &str,
        url_hash: &str,
        directory_key: &str,
        resolved: &crate::config::resolver::ResolvedConfig,
    ) -> GatewayResult<()> {
        let lock_ttl = resolved.render_timeout_secs as i64 + 5;
        let acquired = self
            .state
            .meta_store
            .acquire_lock(directory_key, "recache", lock_ttl)
            .await?;
        if !acquired {
            // A request-path render or another recache is already refreshing
            // this key — nothing left for this entry to do.
            return Ok(());
        }

        let render_outcome = self.render_one(host_id, entry, canonical_url, resolved).await;
        self.state.meta_store.release_lock(directory_key).await.ok();

        let outcome = render_outcome?;
        let cacheable = resolved.bypass_cacheable_status_codes.contains(&outcome.meta.status_code)
            || outcome.meta.status_code == 200;

        if cacheable {
            let created_at = now_unix();
            let expires_at = created_at + resolved.render_cache_ttl_secs;
            let relative_path = FsCache::relative_path(
                host_id,
                entry.dimension_id,
                url_hash,
                expires_at,
                resolved.compression_algorithm,
            );
            let meta = CacheMetadata {
                key: directory_key.to_string(),
                source_url: entry.url.clone(),
                canonical_url: canonical_url.to_string(),
                file_path: relative_path,
                created_at,
                expires_at,
                stale_ttl_secs: resolved.render_cache_stale_ttl_secs,
                last_access: created_at,
                logical_size: outcome.html.len() as u64,
                on_disk_size: 0,
                source_tag: SourceTag::Render,
                origin_status_code: outcome.meta.status_code,
                headers: filter_headers(&outcome.meta.headers, &resolved.safe_request_headers),
                owning_eg_ids: vec![self.self_eg_id.clone()],
                last_bot_hit: None,
                index_status: None,
                title: outcome.meta.title.clone(),
            };

            self.state
                .coordinator
                .store(
                    &meta,
                    &outcome.html,
                    resolved.compression_algorithm,
                    resolved.sharding_enabled,
                    resolved.sharding_push_on_render,
                    resolved.sharding_replication_factor,
                )
                .await?;
        }

        self.state.meta_store.update_field(directory_key, "last_bot_hit", "").await.ok();
        self.emit_precache_event(host_id, directory_key, outcome.meta.status_code);
        Ok(())
    }

    async fn render_one(
        &self,
        host_id: u32,
        entry: &RecacheEntry,
        canonical_url: &str,
        resolved: &crate::config::resolver::ResolvedConfig,
    ) -> GatewayResult<crate::render_client::RenderOutcome> {
        let compiled = self.state.config.load_full();
        let host = compiled
            .hosts_by_id
            .get(&host_id)
            .ok_or_else(|| crate::error::GatewayError::ConfigurationError("host vanished during recache".to_string()))?;
        let dimension = host.host.find_dimension(entry.dimension_id).ok_or_else(|| {
            crate::error::GatewayError::ConfigurationError("dimension vanished during recache".to_string())
        })?;

        let strategy = match resolved.render_cache_strategy {
            crate::config::CacheStrategy::LeastLoaded => TabSelectStrategy::LeastLoaded,
            crate::config::CacheStrategy::MostAvailable => TabSelectStrategy::MostAvailable,
            crate::config::CacheStrategy::RoundRobin => TabSelectStrategy::RoundRobin,
        };
        let reservation_ttl = 2i64.max(resolved.render_timeout_secs as i64 + 5);
        let request_id = format!("recache-{}", uuid::Uuid::new_v4());

        let reservation = self
            .state
            .rs_selector
            .select_and_reserve(&request_id, strategy, reservation_ttl)
            .await?;
        let (rs_id, tab_index, address, port) = match reservation {
            SelectOutcome::Reserved { rs_id, tab_index, address, port } => (rs_id, tab_index, address, port),
            SelectOutcome::NoCapacity | SelectOutcome::NoServices => {
                return Err(crate::error::GatewayError::UpstreamUnavailable(
                    "no render service capacity for recache".to_string(),
                ));
            }
        };

        let request = RenderRequest {
            url: canonical_url.to_string(),
            request_id,
            tab_id: tab_index,
            timeout_ms: resolved.render_timeout_secs * 1000,
            viewport_width: dimension.width,
            viewport_height: dimension.height,
            user_agent: dimension.rendering_user_agent.clone(),
            blocked_patterns: resolved.render_blocked_patterns.clone(),
            blocked_resource_types: Vec::new(),
        };

        let result = self.state.render_client.render(&address, port, &request).await;
        self.state.rs_selector.release(&rs_id, tab_index).await.ok();
        result
    }

    fn emit_precache_event(&self, host_id: u32, directory_key: &str, status: u16) {
        let mut fields = EventFields::new();
        fields.insert("request_id".to_string(), "-".to_string());
        fields.insert("host_id".to_string(), host_id.to_string());
        fields.insert("outcome".to_string(), "precache".to_string());
        fields.insert("status".to_string(), status.to_string());
        fields.insert("cache_key".to_string(), directory_key.to_string());
        fields.insert("client_ip".to_string(), "-".to_string());
        fields.insert("latency_ms".to_string(), "0".to_string());
        self.state.events.emit(&self.state.event_template, &fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::coordinator::CacheCoordinator;
    use crate::cache::fs::FsCache;
    use crate::cache::meta::MetadataStore;
    use crate::cluster::ClusterRegistry;
    use crate::config::resolver::CompiledConfig;
    use crate::config::Config;
    use crate::directory::memory::MemoryDirectory;
    use crate::events::{EventEmitter, EventEmitterConfig};
    use crate::rs_select::RsSelector;
    use crate::tabs::TabManager;
    use arc_swap::ArcSwap;

    fn make_state(dir: Arc<MemoryDirectory>) -> Arc<GatewayState> {
        let meta_store = Arc::new(MetadataStore::new(dir.clone()));
        let fs_cache = Arc::new(FsCache::new(std::env::temp_dir().join("rendergate-recache-test")));
        let cluster = Arc::new(ClusterRegistry::new(dir.clone(), 3));
        let coordinator = Arc::new(CacheCoordinator::new(
            meta_store.clone(),
            fs_cache,
            cluster.clone(),
            "eg-1".to_string(),
            "bearer".to_string(),
        ));
        let tabs = Arc::new(TabManager::new(dir.clone(), 10));
        let rs_selector = Arc::new(RsSelector::new(dir.clone(), tabs));
        let events = Arc::new(EventEmitter::spawn(EventEmitterConfig {
            path: std::env::temp_dir().join("rendergate-recache-test-events.log"),
            template: "{request_id} {outcome}".to_string(),
            max_size_mb: 0,
            max_backups: 0,
            compress_backups: false,
            channel_capacity: 16,
        }));

        Arc::new(GatewayState {
            self_eg_id: "eg-1".to_string(),
            config: ArcSwap::from_pointee(CompiledConfig::build(Arc::new(Config::default()))),
            directory: dir,
            meta_store,
            coordinator,
            cluster,
            tabs_ttl_secs: 10,
            rs_selector,
            render_client: crate::render_client::RenderClient::new(),
            bypass: crate::bypass::BypassFetcher::new(false),
            events,
            event_template: "{request_id} {outcome}".to_string(),
            single_flight_degraded_total: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn drain_host_respects_budget_and_increments_metric() {
        let dir = Arc::new(MemoryDirectory::new());
        let state = make_state(dir.clone());
        let scheduler = RecacheScheduler::new(state, RecacheConfig::default(), "eg-1".to_string(), "bearer".to_string());

        for i in 0..3 {
            let member = serde_json::json!({"url": format!("https://example.com/{i}"), "dimension_id": 1, "attempt": 0}).to_string();
            dir.zadd("recache:1:high", &member, 0.0).await.unwrap();
        }

        let popped = scheduler.drain_host(1, Priority::High, 2).await.unwrap();
        assert_eq!(popped, 2);

        let remaining = dir.zpopmin_below("recache:1:high", now_unix() as f64, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn priority_order_drains_high_before_autorecache_and_normal() {
        let dir = Arc::new(MemoryDirectory::new());
        let state = make_state(dir.clone());
        let scheduler = RecacheScheduler::new(state, RecacheConfig::default(), "eg-1".to_string(), "bearer".to_string());

        let high = serde_json::json!({"url": "https://example.com/h", "dimension_id": 1, "attempt": 0}).to_string();
        let normal = serde_json::json!({"url": "https://example.com/n", "dimension_id": 1, "attempt": 0}).to_string();
        dir.zadd("recache:1:high", &high, 0.0).await.unwrap();
        dir.zadd("recache:1:normal", &normal, 0.0).await.unwrap();

        let popped_high = scheduler.drain_host(1, Priority::High, 10).await.unwrap();
        assert_eq!(popped_high, 1);
        let popped_normal_before_due = scheduler.drain_host(1, Priority::Normal, 10).await.unwrap();
        assert_eq!(popped_normal_before_due, 1);
    }

    #[tokio::test]
    async fn handle_failure_reschedules_with_backoff_until_max_retries() {
        let dir = Arc::new(MemoryDirectory::new());
        let state = make_state(dir.clone());
        let mut config = RecacheConfig::default();
        config.max_retries = 2;
        let scheduler = RecacheScheduler::new(state, config, "eg-1".to_string(), "bearer".to_string());

        let entry = RecacheEntry { url: "https://example.com/a".to_string(), host_id: 7, dimension_id: 1, attempt: 0 };
        scheduler.handle_failure(entry.clone(), crate::error::GatewayError::UpstreamTimeout).await;

        let rescheduled = dir.zpopmin_below("recache:7:normal", f64::MAX, 10).await.unwrap();
        assert_eq!(rescheduled.len(), 1);
        let reparsed: RecacheEntry = serde_json::from_str(&rescheduled[0].0).unwrap();
        assert_eq!(reparsed.attempt, 1);

        // Exhausting retries drops the entry instead of rescheduling again.
        let last_attempt = RecacheEntry { attempt: 1, ..entry };
        scheduler.handle_failure(last_attempt, crate::error::GatewayError::UpstreamTimeout).await;
        let none_left = dir.zpopmin_below("recache:7:normal", f64::MAX, 10).await.unwrap();
        assert!(none_left.is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_is_paused() {
        let dir = Arc::new(MemoryDirectory::new());
        let state = make_state(dir);
        let scheduler = RecacheScheduler::new(state, RecacheConfig::default(), "eg-1".to_string(), "bearer".to_string());
        assert!(!scheduler.is_paused());
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.resume();
        assert!(!scheduler.is_paused());
    }
}
