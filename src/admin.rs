//! Admin control surface (§9 Open Question 1, SPEC_FULL.md §B): scheduler
//! pause/resume plus a read-only cluster status view, gated by
//! `Gateway.scheduler_control_api`. Grounded on the teacher's `admin/mod.rs`
//! `ServeHttp` app for the `matchit`-routed small-fixed-route shape and its
//! `x-api-key` header check, but without that module's etcd-resource CRUD —
//! this surface exists for test/ops control, not config management, which
//! this crate handles via file reload instead (§A.3).

use std::sync::Arc;

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::Router;
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession};

use crate::orchestrator::GatewayState;
use crate::recache::RecacheScheduler;

pub struct AdminApp {
    state: Arc<GatewayState>,
    scheduler: Arc<RecacheScheduler>,
    api_key: String,
    router: Router<&'static str>,
}

impl AdminApp {
    pub fn new(state: Arc<GatewayState>, scheduler: Arc<RecacheScheduler>, api_key: String) -> Self {
        let mut router = Router::new();
        router.insert("/admin/recache/pause", "pause").unwrap();
        router.insert("/admin/recache/resume", "resume").unwrap();
        router.insert("/admin/recache/status", "recache_status").unwrap();
        router.insert("/admin/cluster/status", "cluster_status").unwrap();
        Self { state, scheduler, api_key, router }
    }

    fn handle_pause(&self) -> Response<Vec<u8>> {
        self.scheduler.pause();
        json_ok(serde_json::json!({ "paused": true }))
    }

    fn handle_resume(&self) -> Response<Vec<u8>> {
        self.scheduler.resume();
        json_ok(serde_json::json!({ "paused": false }))
    }

    fn handle_recache_status(&self) -> Response<Vec<u8>> {
        json_ok(serde_json::json!({ "paused": self.scheduler.is_paused() }))
    }

    async fn handle_cluster_status(&self) -> Response<Vec<u8>> {
        match self.state.cluster.get_healthy_egs().await {
            Ok(egs) => json_ok(serde_json::json!({
                "self_eg_id": self.state.self_eg_id,
                "healthy_egs": egs,
            })),
            Err(e) => {
                log::warn!(error:? = e; "admin cluster status lookup failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "registry unavailable")
            }
        }
    }
}

#[async_trait]
impl ServeHttp for AdminApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        session.set_keepalive(None);

        if !api_key_ok(session, &self.api_key) {
            return error_response(StatusCode::UNAUTHORIZED, "invalid api key");
        }

        let (path, method) = {
            let req = session.req_header();
            (req.uri.path().to_string(), req.method.clone())
        };

        let Ok(matched) = self.router.at(&path) else {
            return error_response(StatusCode::NOT_FOUND, "not found");
        };

        match (*matched.value, &method) {
            ("pause", &Method::POST) => self.handle_pause(),
            ("resume", &Method::POST) => self.handle_resume(),
            ("recache_status", &Method::GET) => self.handle_recache_status(),
            ("cluster_status", &Method::GET) => self.handle_cluster_status().await,
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }
}

fn api_key_ok(session: &ServerSession, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    match session.get_header("x-api-key") {
        Some(key) => key.as_bytes() == expected.as_bytes(),
        None => false,
    }
}

fn api_key_matches(header_value: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    header_value.map(|v| v == expected).unwrap_or(false)
}

fn json_ok(body: serde_json::Value) -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.to_string().into_bytes())
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
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
    fn api_key_rejects_empty_expected_key() {
        assert!(!api_key_matches(Some("anything"), ""));
    }

    #[test]
    fn api_key_requires_exact_match() {
        assert!(api_key_matches(Some("secret"), "secret"));
        assert!(!api_key_matches(Some("wrong"), "secret"));
        assert!(!api_key_matches(None, "secret"));
    }
}
