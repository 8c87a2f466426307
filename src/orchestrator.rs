//! Render orchestrator (C12): the per-request state machine (§4.11). Wires
//! every other component together — AUTH → RESOLVE → DIMENSION → CANON →
//! CACHE_LOOKUP → single-flight RENDER or BYPASS → STORE → SERVE. Grounded on
//! the teacher's `service/http.rs` `ProxyHttp` impl, with the short-circuit
//! response pattern from `plugin/echo.rs`: this gateway assembles every
//! response itself (cache hit, fresh render, bypass, status/block action) and
//! never hands a request to pingora's own upstream-peer proxying, so
//! `request_filter` always returns `Ok(true)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError as PingoraInternalErrorType, Result as PResult};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use uuid::Uuid;

use crate::cache::coordinator::{CacheCoordinator, LookupOutcome};
use crate::cache::meta::{now_unix, CacheMetadata, MetadataStore};
use crate::cache::{CacheKey, SourceTag};
use crate::canon;
use crate::cluster::ClusterRegistry;
use crate::config::resolver::{CompiledConfig, CompiledHost, ResolvedConfig};
use crate::config::RuleAction;
use crate::directory::{Directory, TabSelectStrategy};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventEmitter, EventFields};
use crate::metrics;
use crate::render_client::{RenderClient, RenderRequest};
use crate::rs_select::{RsSelector, SelectOutcome};
use crate::bypass::BypassFetcher;
use crate::utils::request::{get_client_ip, get_query_value, get_req_header_value, get_request_host};

/// Margin added to `render.timeout` when deriving the lock TTL (§5).
const LOCK_MARGIN_SECS: i64 = 5;
/// Fixed poll interval for the wait-on-cache loop (§4.11 WAIT).
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound on wait-on-cache regardless of configuration (§5).
const WAIT_TIMEOUT_CEILING: Duration = Duration::from_secs(2);

/// Everything the orchestrator depends on, built once at startup and shared
/// behind `Arc` (§9: "composed by dependency injection at startup; no
/// cyclic ownership"). The orchestrator itself carries no per-request state.
pub struct GatewayState {
    pub self_eg_id: String,
    pub config: ArcSwap<CompiledConfig>,
    pub directory: Arc<dyn Directory>,
    pub meta_store: Arc<MetadataStore>,
    pub coordinator: Arc<CacheCoordinator>,
    pub cluster: Arc<ClusterRegistry>,
    pub tabs_ttl_secs: i64,
    pub rs_selector: Arc<RsSelector>,
    pub render_client: RenderClient,
    pub bypass: BypassFetcher,
    pub events: Arc<EventEmitter>,
    pub event_template: String,
    pub single_flight_degraded_total: AtomicU64,
}

impl GatewayState {
    pub fn single_flight_degraded(&self) -> u64 {
        self.single_flight_degraded_total.load(Ordering::Relaxed)
    }
}

/// Per-request context. Stack-allocated for the lifetime of one request —
/// the orchestrator itself owns no long-lived state (§9).
pub struct RequestContext {
    pub request_id: String,
    pub start: Instant,
}

pub struct RenderGateway {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl ProxyHttp for RenderGateway {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext {
            request_id: Uuid::new_v4().to_string(),
            start: Instant::now(),
        }
    }

    /// This gateway never forwards to a pingora-selected upstream peer — every
    /// response is assembled in `request_filter`, which always short-circuits
    /// with `Ok(true)`. A call here means that contract was violated.
    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> PResult<Box<HttpPeer>> {
        Error::e_explain(
            PingoraInternalErrorType,
            "rendergate never proxies to an upstream peer",
        )
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> PResult<bool> {
        let path = session.req_header().uri.path().to_string();
        match path.as_str() {
            "/health" => {
                write_plain(session, StatusCode::OK, "OK").await?;
            }
            "/ready" => {
                let ready = self.state.directory.ping().await.is_ok();
                let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
                write_plain(session, status, if ready { "OK" } else { "Not Ready" }).await?;
            }
            "/render" => {
                self.handle_render(session, ctx).await?;
            }
            _ => {
                write_plain(session, StatusCode::NOT_FOUND, "Not Found").await?;
            }
        }
        Ok(true)
    }
}

impl RenderGateway {
    async fn handle_render(&self, session: &mut Session, ctx: &mut RequestContext) -> PResult<()> {
        let method = session.req_header().method.clone();
        if method != http::Method::GET && method != http::Method::HEAD {
            return self.fail(session, ctx, GatewayError::UnsupportedMethod, None).await;
        }

        match self.run_pipeline(session, ctx).await {
            Ok(()) => Ok(()),
            Err(e) => self.fail(session, ctx, e, None).await,
        }
    }

    async fn fail(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        err: GatewayError,
        host_id: Option<u32>,
    ) -> PResult<()> {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.body();
        let client_ip = get_client_ip(session);
        self.log_event(ctx, host_id, None, err.category(), status.as_u16(), Some(&client_ip));
        write_plain_with_request_id(session, status, &body, &ctx.request_id).await
    }

    /// The full INIT → ... → DONE pipeline for a single `/render` request.
    async fn run_pipeline(&self, session: &mut Session, ctx: &mut RequestContext) -> GatewayResult<()> {
        let compiled = self.state.config.load_full();

        // --- INIT: pull the required query param and client context ---
        let raw_url = get_query_value(session.req_header(), "url")
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidRequest("missing 'url' query parameter".to_string()))?;
        let user_agent = get_req_header_value(session.req_header(), "User-Agent")
            .unwrap_or_default()
            .to_string();

        // --- AUTH: host resolved by request-target domain, render key checked ---
        let domain = get_request_host(session.req_header())
            .ok_or_else(|| GatewayError::InvalidRequest("no host in request".to_string()))?
            .to_ascii_lowercase();
        let host = compiled
            .find_host_by_domain(&domain)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown host '{domain}'")))?;

        let render_key = get_req_header_value(session.req_header(), "X-Render-Key").unwrap_or_default();
        if render_key != host.host.render_key {
            return Err(GatewayError::AuthFailure("render key mismatch".to_string()));
        }

        // --- CANON (performed ahead of RESOLVE so rule matching has a
        // canonical path+query to match against; tracking-param stripping is
        // a host-level overlay, never rule-level, so it needs no rule match) ---
        let strip_patterns = compiled.strip_patterns_for(host);
        let canon_result = canon::normalize(&raw_url, &strip_patterns)?;
        let url_hash = canon::hash(&canon_result.canonical);
        if !canon_result.stripped.is_empty() {
            log::info!(
                request_id = ctx.request_id.as_str(),
                host_id = host.host.id,
                stripped:? = canon_result.stripped;
                "stripped tracking parameters"
            );
        }

        let path_and_query = path_and_query_of(&canon_result.canonical);
        let resolved = compiled.resolve(host, &path_and_query)?;

        // --- DIMENSION ---
        let (dimension_id, unmatched_dimension) = match self.select_dimension(host, &resolved, &user_agent)? {
            DimensionOutcome::Matched(id) => (id, false),
            DimensionOutcome::Fallback(id) => (id, true),
            DimensionOutcome::GoBypass => {
                return self
                    .run_bypass(session, ctx, host.host.id, &resolved, &raw_url, &canon_result.canonical, &path_and_query, None)
                    .await;
            }
            DimensionOutcome::Block => return Err(GatewayError::UnmatchedBlock),
        };

        if let RuleAction::Status { code } = resolved.action {
            return self.serve_status(session, ctx, host.host.id, code, &resolved, &canon_result.canonical).await;
        }
        if matches!(resolved.action, RuleAction::Block) {
            return Err(GatewayError::UnmatchedBlock);
        }

        let cache_key = CacheKey { host_id: host.host.id, dimension_id };
        let directory_key = cache_key.directory_key(&url_hash);

        if matches!(resolved.action, RuleAction::Bypass) {
            return self
                .run_bypass(
                    session,
                    ctx,
                    host.host.id,
                    &resolved,
                    &raw_url,
                    &canon_result.canonical,
                    &path_and_query,
                    Some(&directory_key),
                )
                .await;
        }

        // --- CACHE_LOOKUP ---
        let lookup = self
            .state
            .coordinator
            .lookup(
                &directory_key,
                resolved.sharding_enabled,
                resolved.sharding_replication_factor,
                resolved.sharding_replicate_on_pull,
            )
            .await?;

        if let LookupOutcome::Hit { meta, body } = lookup {
            let now = now_unix();
            let expired = meta.expires_at <= now;
            if !expired {
                metrics::CACHE_HITS_TOTAL.with_label_values(&[&host.host.id.to_string()]).inc();
                self.handle_bot_hit(host, dimension_id, &directory_key, &user_agent, &meta).await;
                return self
                    .serve_cached(session, ctx, host.host.id, &meta, &body, unmatched_dimension, &canon_result.canonical)
                    .await;
            }

            // STALE SERVE: expired but within stale window, and a render is
            // already in flight for this key — serve stale rather than wait.
            if now <= meta.expires_at + meta.stale_ttl_secs
                && self.state.meta_store.lock_held(&directory_key).await?
            {
                metrics::STALE_SERVED_TOTAL.with_label_values(&[&host.host.id.to_string()]).inc();
                return self
                    .serve_cached(session, ctx, host.host.id, &meta, &body, unmatched_dimension, &canon_result.canonical)
                    .await;
            }
        }
        metrics::CACHE_MISSES_TOTAL.with_label_values(&[&host.host.id.to_string()]).inc();

        // --- ACQUIRE_LOCK / single-flight ---
        let lock_ttl = resolved.render_timeout_secs as i64 + LOCK_MARGIN_SECS;
        if lock_ttl <= 0 {
            return Err(GatewayError::ConfigurationError("lock ttl must be > 0".to_string()));
        }
        let acquired = self
            .state
            .meta_store
            .acquire_lock(&directory_key, &ctx.request_id, lock_ttl)
            .await?;

        if !acquired {
            // WAITING → WAIT_CACHE: poll until hit or wait_timeout, then BYPASS.
            let wait_timeout = WAIT_TIMEOUT_CEILING.min(Duration::from_secs(resolved.render_timeout_secs));
            if let Some((meta, body)) = self.wait_for_cache(&directory_key, wait_timeout).await? {
                return self
                    .serve_cached(session, ctx, host.host.id, &meta, &body, unmatched_dimension, &canon_result.canonical)
                    .await;
            }
            self.state.single_flight_degraded_total.fetch_add(1, Ordering::Relaxed);
            metrics::LOCK_WAIT_TIMEOUTS_TOTAL.with_label_values(&[&host.host.id.to_string()]).inc();
            return self
                .run_bypass(
                    session,
                    ctx,
                    host.host.id,
                    &resolved,
                    &raw_url,
                    &canon_result.canonical,
                    &path_and_query,
                    Some(&directory_key),
                )
                .await;
        }

        // --- ACQUIRED → DISPATCH → RENDER ---
        let render_result = self
            .do_render(host, host.host.id, dimension_id, &ctx.request_id, &resolved, &canon_result.canonical)
            .await;

        let outcome = match render_result {
            Ok(outcome) => outcome,
            Err(_) => {
                self.state.meta_store.release_lock(&directory_key).await.ok();
                metrics::RENDERS_TOTAL.with_label_values(&[&host.host.id.to_string(), "fail_fallback_bypass"]).inc();
                return self
                    .run_bypass(
                        session,
                        ctx,
                        host.host.id,
                        &resolved,
                        &raw_url,
                        &canon_result.canonical,
                        &path_and_query,
                        Some(&directory_key),
                    )
                    .await;
            }
        };

        let cacheable = resolved.bypass_cacheable_status_codes.contains(&outcome.meta.status_code)
            || outcome.meta.status_code == 200;

        if cacheable {
            let created_at = now_unix();
            let expires_at = created_at + resolved.render_cache_ttl_secs;
            let relative_path = crate::cache::fs::FsCache::relative_path(
                host.host.id,
                dimension_id,
                &url_hash,
                expires_at,
                resolved.compression_algorithm,
            );
            let meta = CacheMetadata {
                key: directory_key.clone(),
                source_url: raw_url.clone(),
                canonical_url: canon_result.canonical.clone(),
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
                owning_eg_ids: vec![self.state.self_eg_id.clone()],
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

        self.state.meta_store.release_lock(&directory_key).await.ok();
        metrics::RENDERS_TOTAL.with_label_values(&[&host.host.id.to_string(), "ok"]).inc();

        self.serve_body(
            session,
            ctx,
            host.host.id,
            "render",
            outcome.meta.status_code,
            &outcome.html,
            &outcome.meta.headers,
            unmatched_dimension,
            &canon_result.canonical,
        )
        .await
    }

    /// DIMENSION step (§4.11): first dimension whose UA patterns match wins;
    /// a rule's `dimension_override` counts as a successful match.
    fn select_dimension(
        &self,
        host: &CompiledHost,
        resolved: &ResolvedConfig,
        user_agent: &str,
    ) -> GatewayResult<DimensionOutcome> {
        if let Some(dim_id) = resolved.dimension_override {
            if host.host.find_dimension(dim_id).is_none() {
                return Err(GatewayError::ConfigurationError(format!(
                    "rule dimension override {dim_id} does not exist on host {}",
                    host.host.id
                )));
            }
            return Ok(DimensionOutcome::Matched(dim_id));
        }

        if let Some(d) = host.match_dimension(user_agent) {
            return Ok(DimensionOutcome::Matched(d.id));
        }

        match resolved.action {
            RuleAction::Bypass => Ok(DimensionOutcome::GoBypass),
            RuleAction::Block => Ok(DimensionOutcome::Block),
            _ => match host.host.fallback_dimension_id {
                Some(id) if host.host.find_dimension(id).is_some() => Ok(DimensionOutcome::Fallback(id)),
                _ => Err(GatewayError::ConfigurationError(format!(
                    "host {} has no matching dimension and no valid fallback",
                    host.host.id
                ))),
            },
        }
    }

    async fn wait_for_cache(
        &self,
        directory_key: &str,
        wait_timeout: Duration,
    ) -> GatewayResult<Option<(CacheMetadata, Vec<u8>)>> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(LookupOutcome::Hit { meta, body }) =
                self.state.coordinator.lookup_local(directory_key).await?
            {
                if meta.expires_at > now_unix() {
                    return Ok(Some((meta, body)));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// RENDER → SELECT_RS → CALL_RS, with one retry on network failure using
    /// a fresh tab reservation (§4.11 Failure semantics).
    async fn do_render(
        &self,
        host: &CompiledHost,
        host_id: u32,
        dimension_id: u32,
        request_id: &str,
        resolved: &ResolvedConfig,
        canonical_url: &str,
    ) -> GatewayResult<crate::render_client::RenderOutcome> {
        let dimension = host
            .host
            .find_dimension(dimension_id)
            .ok_or_else(|| GatewayError::ConfigurationError("dimension vanished after selection".to_string()))?;

        let strategy = match resolved.render_cache_strategy {
            crate::config::CacheStrategy::LeastLoaded => TabSelectStrategy::LeastLoaded,
            crate::config::CacheStrategy::MostAvailable => TabSelectStrategy::MostAvailable,
            crate::config::CacheStrategy::RoundRobin => TabSelectStrategy::RoundRobin,
        };

        let reservation_ttl = 2i64.max(resolved.render_timeout_secs as i64 + 5);

        let mut attempt = 0;
        loop {
            let reservation = self
                .state
                .rs_selector
                .select_and_reserve(request_id, strategy, reservation_ttl)
                .await?;

            let (rs_id, tab_index, address, port) = match reservation {
                SelectOutcome::Reserved { rs_id, tab_index, address, port } => (rs_id, tab_index, address, port),
                SelectOutcome::NoCapacity | SelectOutcome::NoServices => {
                    return Err(GatewayError::UpstreamUnavailable("no render service capacity".to_string()));
                }
            };

            let request = RenderRequest {
                url: canonical_url.to_string(),
                request_id: request_id.to_string(),
                tab_id: tab_index,
                timeout_ms: resolved.render_timeout_secs * 1000,
                viewport_width: dimension.width,
                viewport_height: dimension.height,
                user_agent: dimension.rendering_user_agent.clone(),
                blocked_patterns: resolved.render_blocked_patterns.clone(),
                blocked_resource_types: Vec::new(),
            };

            let start = Instant::now();
            let result = self.state.render_client.render(&address, port, &request).await;
            self.state.rs_selector.release(&rs_id, tab_index).await.ok();
            metrics::RENDER_LATENCY_MS
                .with_label_values(&[&host_id.to_string()])
                .observe(start.elapsed().as_millis() as f64);

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(GatewayError::UpstreamTimeout) => return Err(GatewayError::UpstreamTimeout),
                Err(e) if attempt == 0 => {
                    attempt += 1;
                    log::warn!(request_id = request_id, error:? = e; "render attempt failed, retrying with a fresh tab");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_bypass(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        host_id: u32,
        resolved: &ResolvedConfig,
        raw_url: &str,
        canonical_url: &str,
        _path_and_query: &str,
        directory_key: Option<&str>,
    ) -> GatewayResult<()> {
        let safe_headers: Vec<(String, String)> = resolved
            .safe_request_headers
            .iter()
            .filter_map(|h| get_req_header_value(session.req_header(), h).map(|v| (h.clone(), v.to_string())))
            .collect();

        let user_agent = get_req_header_value(session.req_header(), "User-Agent").unwrap_or_default();

        let result = self
            .state
            .bypass
            .fetch(
                raw_url,
                Duration::from_secs(resolved.bypass_timeout_secs),
                &safe_headers,
                user_agent,
            )
            .await;

        let bypass_result = match result {
            Ok(r) => r,
            Err(_) => return Err(GatewayError::UpstreamUnavailable("origin unreachable".to_string())),
        };

        metrics::BYPASS_TOTAL.with_label_values(&[&host_id.to_string(), "ok"]).inc();

        if resolved.bypass_cache_enabled && resolved.bypass_cacheable_status_codes.contains(&bypass_result.status) {
            if let Some(key) = directory_key {
                if let Ok(parsed) = key_parts(key) {
                    let (_h, dim, hash) = parsed;
                    let created_at = now_unix();
                    let expires_at = created_at + resolved.bypass_cache_ttl_secs;
                    let relative_path = crate::cache::fs::FsCache::relative_path(
                        host_id,
                        dim,
                        &hash,
                        expires_at,
                        resolved.compression_algorithm,
                    );
                    let meta = CacheMetadata {
                        key: key.to_string(),
                        source_url: raw_url.to_string(),
                        canonical_url: canonical_url.to_string(),
                        file_path: relative_path,
                        created_at,
                        expires_at,
                        stale_ttl_secs: 0,
                        last_access: created_at,
                        logical_size: bypass_result.body.len() as u64,
                        on_disk_size: 0,
                        source_tag: SourceTag::Bypass,
                        origin_status_code: bypass_result.status,
                        headers: bypass_result.headers.clone(),
                        owning_eg_ids: vec![self.state.self_eg_id.clone()],
                        last_bot_hit: None,
                        index_status: None,
                        title: None,
                    };
                    self.state
                        .coordinator
                        .store(
                            &meta,
                            &bypass_result.body,
                            resolved.compression_algorithm,
                            resolved.sharding_enabled,
                            resolved.sharding_push_on_render,
                            resolved.sharding_replication_factor,
                        )
                        .await
                        .ok();
                }
            }
        }

        self.serve_body(
            session,
            ctx,
            host_id,
            "bypass",
            bypass_result.status,
            &bypass_result.body,
            &bypass_result.headers,
            false,
            canonical_url,
        )
        .await
    }

    async fn serve_status(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        host_id: u32,
        code: u16,
        resolved: &ResolvedConfig,
        canonical_url: &str,
    ) -> GatewayResult<()> {
        self.serve_body(session, ctx, host_id, "status", code, &[], &resolved.status_headers, false, canonical_url)
            .await
    }

    async fn serve_cached(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        host_id: u32,
        meta: &CacheMetadata,
        body: &[u8],
        unmatched_dimension: bool,
        canonical_url: &str,
    ) -> GatewayResult<()> {
        self.serve_body(
            session,
            ctx,
            host_id,
            meta.source_tag.as_str(),
            meta.origin_status_code,
            body,
            &meta.headers,
            unmatched_dimension,
            canonical_url,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_body(
        &self,
        session: &mut Session,
        ctx: &mut RequestContext,
        host_id: u32,
        outcome: &str,
        status: u16,
        body: &[u8],
        headers: &HashMap<String, String>,
        unmatched_dimension: bool,
        canonical_url: &str,
    ) -> GatewayResult<()> {
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        let mut resp = ResponseHeader::build(status_code, None)
            .map_err(|e| GatewayError::InternalError(format!("response header build: {e}")))?;

        for (k, v) in headers {
            resp.insert_header(k.clone(), v.clone()).ok();
        }
        resp.insert_header("X-Request-ID", ctx.request_id.clone()).ok();
        resp.insert_header("X-Processed-URL", canonical_url.to_string()).ok();
        if unmatched_dimension {
            resp.insert_header("X-Unmatched-Dimension", "true").ok();
        }
        resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string()).ok();

        session
            .write_response_header(Box::new(resp), body.is_empty())
            .await
            .map_err(|e| GatewayError::InternalError(format!("write response header: {e}")))?;
        if !body.is_empty() {
            session
                .write_response_body(Some(Bytes::copy_from_slice(body)), true)
                .await
                .map_err(|e| GatewayError::InternalError(format!("write response body: {e}")))?;
        }

        let client_ip = get_client_ip(session);
        self.log_event(ctx, Some(host_id), Some(outcome), outcome, status, Some(&client_ip));
        Ok(())
    }

    /// BOT-HIT TRIGGER (§4.11): on a cache hit from a bot UA, record the hit
    /// and enqueue an autorecache. Non-fatal if the enqueue fails.
    async fn handle_bot_hit(
        &self,
        host: &CompiledHost,
        dimension_id: u32,
        directory_key: &str,
        user_agent: &str,
        meta: &CacheMetadata,
    ) {
        let compiled = self.state.config.load_full();
        if !compiled.bot_alias_patterns.is_match(user_agent) {
            return;
        }
        let d = &compiled.raw.defaults.bothit_recache;
        if !d.enabled {
            return;
        }
        let now = now_unix();
        self.state
            .meta_store
            .update_field(directory_key, "last_bot_hit", &now.to_string())
            .await
            .ok();

        let member = serde_json::json!({
            "url": meta.source_url,
            "host_id": host.host.id,
            "dimension_id": dimension_id,
            "attempt": 0,
        })
        .to_string();
        let score = (now + d.interval_secs) as f64;
        self.state
            .directory
            .zadd(&format!("recache:{}:autorecache", host.host.id), &member, score)
            .await
            .ok();
    }

    fn log_event(
        &self,
        ctx: &RequestContext,
        host_id: Option<u32>,
        cache_key: Option<&str>,
        outcome: &str,
        status: u16,
        client_ip: Option<&str>,
    ) {
        let mut fields = EventFields::new();
        fields.insert("request_id".to_string(), ctx.request_id.clone());
        fields.insert("host_id".to_string(), host_id.map(|h| h.to_string()).unwrap_or_default());
        fields.insert("outcome".to_string(), outcome.to_string());
        fields.insert("status".to_string(), status.to_string());
        fields.insert("cache_key".to_string(), cache_key.unwrap_or_default().to_string());
        fields.insert("client_ip".to_string(), client_ip.unwrap_or_default().to_string());
        fields.insert(
            "latency_ms".to_string(),
            ctx.start.elapsed().as_millis().to_string(),
        );
        self.state.events.emit(&self.state.event_template, &fields);
    }
}

enum DimensionOutcome {
    Matched(u32),
    Fallback(u32),
    GoBypass,
    Block,
}

pub(crate) fn path_and_query_of(canonical_url: &str) -> String {
    match url::Url::parse(canonical_url) {
        Ok(u) => {
            let mut out = u.path().to_string();
            if let Some(q) = u.query() {
                out.push('?');
                out.push_str(q);
            }
            out
        }
        Err(_) => canonical_url.to_string(),
    }
}

pub(crate) fn filter_headers(headers: &HashMap<String, String>, allow: &[String]) -> HashMap<String, String> {
    if allow.is_empty() {
        return headers.clone();
    }
    headers
        .iter()
        .filter(|(k, _)| allow.iter().any(|a| a.eq_ignore_ascii_case(k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn key_parts(key: &str) -> GatewayResult<(u32, u32, String)> {
    let mut parts = key.splitn(4, ':');
    let _prefix = parts.next();
    let host = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| GatewayError::InternalError("malformed cache key".to_string()))?;
    let dim = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| GatewayError::InternalError("malformed cache key".to_string()))?;
    let hash = parts
        .next()
        .ok_or_else(|| GatewayError::InternalError("malformed cache key".to_string()))?
        .to_string();
    Ok((host, dim, hash))
}

async fn write_plain(session: &mut Session, status: StatusCode, body: &str) -> PResult<()> {
    let mut resp = ResponseHeader::build(status, None)?;
    resp.insert_header(http::header::CONTENT_TYPE, "text/plain")?;
    resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
        .await?;
    Ok(())
}

async fn write_plain_with_request_id(
    session: &mut Session,
    status: StatusCode,
    body: &str,
    request_id: &str,
) -> PResult<()> {
    let mut resp = ResponseHeader::build(status, None)?;
    resp.insert_header(http::header::CONTENT_TYPE, "text/plain")?;
    resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;
    resp.insert_header("X-Request-ID", request_id.to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_extracts_from_canonical_url() {
        assert_eq!(path_and_query_of("https://example.com/a?b=1"), "/a?b=1");
        assert_eq!(path_and_query_of("https://example.com/a"), "/a");
    }

    #[test]
    fn key_parts_splits_cache_key() {
        let (host, dim, hash) = key_parts("cache:1:2:abcd1234").unwrap();
        assert_eq!(host, 1);
        assert_eq!(dim, 2);
        assert_eq!(hash, "abcd1234");
    }

    #[test]
    fn filter_headers_is_case_insensitive_allowlist() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/html".to_string());
        headers.insert("X-Extra".to_string(), "drop-me".to_string());
        let filtered = filter_headers(&headers, &["content-type".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("Content-Type"));
    }
}
