//! Internal EG↔EG / daemon→EG HTTP surface (§6): cache pull/push for
//! replication (C9), a cluster status view, an admin-triggered recache
//! enqueue, and a debug-only HAR-render handle. Every route requires the
//! shared bearer key. Grounded on the teacher's `admin/mod.rs` `ServeHttp`
//! app — a `matchit` router dispatching to small handlers — but without that
//! module's generic-resource machinery, since this surface has a fixed,
//! small route table rather than open-ended CRUD.

use std::sync::Arc;

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::Router;
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession};

use crate::cache::meta::{now_unix, CacheMetadata};
use crate::error::GatewayError;
use crate::orchestrator::GatewayState;

pub struct InternalApp {
    state: Arc<GatewayState>,
    bearer_key: String,
    router: Router<&'static str>,
}

impl InternalApp {
    pub fn new(state: Arc<GatewayState>, bearer_key: String) -> Self {
        let mut router = Router::new();
        router.insert("/internal/cache/pull", "pull").unwrap();
        router.insert("/internal/cache/push", "push").unwrap();
        router.insert("/internal/cache/status", "status").unwrap();
        router.insert("/internal/cache/recache", "recache").unwrap();
        router.insert("/internal/har-render", "har_render").unwrap();
        Self { state, bearer_key, router }
    }

    async fn handle_pull(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let Some(cache_key) = query_value(session, "cache_key") else {
            return error_response(StatusCode::BAD_REQUEST, "missing cache_key");
        };

        match self.state.coordinator.lookup_local(&cache_key).await {
            Ok(Some(crate::cache::coordinator::LookupOutcome::Hit { meta, body })) => {
                let header = shard_metadata_header_json(&meta);
                Response::builder()
                    .status(StatusCode::OK)
                    .header("X-Shard-Metadata", header)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(body)
                    .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
            }
            Ok(_) => error_response(StatusCode::NOT_FOUND, "miss"),
            Err(e) => {
                log::warn!(cache_key = cache_key.as_str(), error:? = e; "internal pull failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "lookup failed")
            }
        }
    }

    async fn handle_push(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let Some(header_value) = session
            .req_header()
            .headers
            .get("X-Shard-Metadata")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return error_response(StatusCode::BAD_REQUEST, "missing X-Shard-Metadata header");
        };

        let body = match read_body(session).await {
            Ok(b) => b,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let meta = match crate::cache::coordinator::parse_shard_metadata(&header_value, "") {
            Ok(m) => m,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        match self.state.coordinator.receive_push(&meta, &body).await {
            Ok(()) => Response::builder().status(StatusCode::OK).body(Vec::new()).unwrap(),
            Err(e) => {
                log::warn!(cache_key = meta.key.as_str(), error:? = e; "internal push failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "push failed")
            }
        }
    }

    /// Cluster view (B.2 in SPEC_FULL): this EG's id, the healthy EG set
    /// (C7), and per-host hit/miss counters read straight off the registry
    /// this crate already maintains for `/metrics`.
    async fn handle_status(&self, _session: &mut ServerSession) -> Response<Vec<u8>> {
        let healthy = match self.state.cluster.get_healthy_egs().await {
            Ok(egs) => egs,
            Err(e) => {
                log::warn!(error:? = e; "cluster status lookup failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "registry unavailable");
            }
        };

        let compiled = self.state.config.load_full();
        let per_host: Vec<serde_json::Value> = compiled
            .raw
            .hosts
            .iter()
            .map(|h| {
                let host_id = h.id.to_string();
                serde_json::json!({
                    "host_id": h.id,
                    "cache_hits_total": crate::metrics::CACHE_HITS_TOTAL.with_label_values(&[&host_id]).get(),
                    "cache_misses_total": crate::metrics::CACHE_MISSES_TOTAL.with_label_values(&[&host_id]).get(),
                })
            })
            .collect();

        let view = serde_json::json!({
            "self_eg_id": self.state.self_eg_id,
            "healthy_egs": healthy,
            "single_flight_degraded_total": self.state.single_flight_degraded(),
            "hosts": per_host,
        });

        match serde_json::to_vec(&view) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap(),
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed"),
        }
    }

    /// Admin-triggered recache (§6): enqueues at `high` priority, since an
    /// explicit request outranks both `normal` and the `autorecache` tier.
    async fn handle_recache(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let body = match read_body(session).await {
            Ok(b) => b,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        #[derive(serde::Deserialize)]
        struct RecacheRequest {
            url: String,
            host_id: u32,
            dimension_id: u32,
        }

        let req: RecacheRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("bad json: {e}")),
        };

        let member = serde_json::json!({
            "url": req.url,
            "dimension_id": req.dimension_id,
            "attempt": 0,
        })
        .to_string();

        match self
            .state
            .directory
            .zadd(&format!("recache:{}:high", req.host_id), &member, now_unix() as f64)
            .await
        {
            Ok(()) => Response::builder().status(StatusCode::OK).body(Vec::new()).unwrap(),
            Err(e) => {
                log::warn!(host_id = req.host_id, error:? = e; "recache enqueue failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "enqueue failed")
            }
        }
    }

    /// Debug-only (§6): this crate's CDP rendering is opaque, and HAR
    /// capture bytes are an external collaborator (§1 Non-goals). This
    /// handler only manages the `debug:har:{host}:{req}` handle/TTL, not
    /// the capture itself (SPEC_FULL.md B).
    async fn handle_har_render(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let Some(host_id) = query_value(session, "host_id") else {
            return error_response(StatusCode::BAD_REQUEST, "missing host_id");
        };
        let request_id = query_value(session, "request_id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let handle_key = format!("debug:har:{host_id}:{request_id}");
        const HAR_HANDLE_TTL_SECS: i64 = 300;
        if let Err(e) = self.state.directory.set_string(&handle_key, "pending", HAR_HANDLE_TTL_SECS).await {
            log::warn!(error:? = e; "har-render handle write failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "handle write failed");
        }

        let body = serde_json::json!({ "handle": handle_key, "ttl_secs": HAR_HANDLE_TTL_SECS }).to_string();
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into_bytes())
            .unwrap()
    }
}

#[async_trait]
impl ServeHttp for InternalApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        session.set_keepalive(None);

        if !bearer_auth_ok(session, &self.bearer_key) {
            return error_response(StatusCode::UNAUTHORIZED, "invalid bearer token");
        }

        let (path, method) = {
            let req = session.req_header();
            (req.uri.path().to_string(), req.method.clone())
        };

        let Ok(matched) = self.router.at(&path) else {
            return error_response(StatusCode::NOT_FOUND, "not found");
        };

        match (*matched.value, &method) {
            ("pull", &Method::GET) => self.handle_pull(session).await,
            ("push", &Method::POST) => self.handle_push(session).await,
            ("status", &Method::GET) => self.handle_status(session).await,
            ("recache", &Method::POST) => self.handle_recache(session).await,
            ("har_render", &Method::GET) => self.handle_har_render(session).await,
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }
}

fn bearer_auth_ok(session: &ServerSession, expected: &str) -> bool {
    let header_value = session
        .req_header()
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    bearer_token_matches(header_value, expected)
}

fn bearer_token_matches(header_value: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    header_value
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

fn query_value(session: &ServerSession, key: &str) -> Option<String> {
    let query = session.req_header().uri.query()?;
    query_value_from(query, key)
}

fn query_value_from(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn read_body(session: &mut ServerSession) -> Result<Vec<u8>, GatewayError> {
    let mut body = Vec::new();
    while let Some(bytes) = session
        .read_request_body()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("body read failed: {e}")))?
    {
        body.extend_from_slice(&bytes);
    }
    Ok(body)
}

fn shard_metadata_header_json(meta: &CacheMetadata) -> String {
    serde_json::json!({
        "key": meta.key,
        "source_url": meta.source_url,
        "canonical_url": meta.canonical_url,
        "file_path": meta.file_path,
        "created_at": meta.created_at,
        "expires_at": meta.expires_at,
        "stale_ttl_secs": meta.stale_ttl_secs,
        "last_access": meta.last_access,
        "logical_size": meta.logical_size,
        "on_disk_size": meta.on_disk_size,
        "source_tag": meta.source_tag.as_str(),
        "origin_status_code": meta.origin_status_code,
        "headers": meta.headers,
        "owning_eg_ids": meta.owning_eg_ids,
        "last_bot_hit": meta.last_bot_hit,
        "index_status": meta.index_status,
        "title": meta.title,
    })
    .to_string()
}

fn error_response(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .body(message.as_bytes().to_vec())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(b"Internal Server Error".to_vec())
                .unwrap()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_auth_rejects_empty_expected_key() {
        // An empty configured key must never match — guards against a
        // misconfigured gateway silently running with auth disabled.
        assert!(!bearer_token_matches(Some("Bearer anything"), ""));
    }

    #[test]
    fn bearer_auth_requires_exact_token_match() {
        assert!(bearer_token_matches(Some("Bearer secret"), "secret"));
        assert!(!bearer_token_matches(Some("Bearer wrong"), "secret"));
        assert!(!bearer_token_matches(Some("secret"), "secret"));
        assert!(!bearer_token_matches(None, "secret"));
    }

    #[test]
    fn query_value_from_extracts_named_param() {
        assert_eq!(query_value_from("cache_key=abc&x=1", "cache_key").as_deref(), Some("abc"));
        assert_eq!(query_value_from("x=1", "cache_key"), None);
    }
}
