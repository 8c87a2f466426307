//! Render Service client: builds `RenderRequest`, POSTs it to a reserved RS
//! tab, and decodes the length-prefixed binary response (§6). CDP wire
//! handling itself stays an external collaborator (§1) — this client only
//! speaks the EG⇄RS HTTP contract, treating the RS as an opaque
//! "render a URL, return HTML + metrics" capability.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

#[derive(Clone, Debug, Serialize)]
pub struct RenderRequest {
    pub url: String,
    pub request_id: String,
    pub tab_id: u32,
    pub timeout_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub blocked_resource_types: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RenderResponseMeta {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub title: Option<String>,
}

pub struct RenderOutcome {
    pub meta: RenderResponseMeta,
    pub html: Vec<u8>,
}

pub struct RenderClient {
    http_client: reqwest::Client,
}

impl RenderClient {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn render(
        &self,
        address: &str,
        port: u16,
        request: &RenderRequest,
    ) -> GatewayResult<RenderOutcome> {
        let url = format!("http://{address}:{port}/render");
        let timeout = Duration::from_millis(request.timeout_ms) + Duration::from_secs(1);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout
                } else {
                    GatewayError::UpstreamUnavailable(format!("render service unreachable: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "render service returned {}",
                response.status()
            )));
        }

        let is_legacy_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("render response read failed: {e}")))?;

        if is_legacy_json {
            return decode_legacy_json(&bytes);
        }
        decode_length_prefixed(&bytes)
    }
}

impl Default for RenderClient {
    fn default() -> Self {
        Self::new()
    }
}

/// 4-byte big-endian `metadata_len`, then that many bytes of JSON metadata,
/// then raw HTML to end (§6).
fn decode_length_prefixed(raw: &[u8]) -> GatewayResult<RenderOutcome> {
    if raw.len() < 4 {
        return Err(GatewayError::InternalError(
            "render response shorter than length prefix".to_string(),
        ));
    }
    let meta_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + meta_len {
        return Err(GatewayError::InternalError(
            "render response truncated before end of metadata".to_string(),
        ));
    }
    let meta_bytes = &raw[4..4 + meta_len];
    let meta: RenderResponseMeta = serde_json::from_slice(meta_bytes)
        .map_err(|e| GatewayError::InternalError(format!("render metadata decode: {e}")))?;
    let html = raw[4 + meta_len..].to_vec();
    Ok(RenderOutcome { meta, html })
}

#[derive(Deserialize)]
struct LegacyRenderResponse {
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    html: String,
}

fn decode_legacy_json(raw: &[u8]) -> GatewayResult<RenderOutcome> {
    let legacy: LegacyRenderResponse = serde_json::from_slice(raw)
        .map_err(|e| GatewayError::InternalError(format!("legacy render response decode: {e}")))?;
    Ok(RenderOutcome {
        meta: RenderResponseMeta {
            status_code: if legacy.status_code == 0 { 200 } else { legacy.status_code },
            headers: legacy.headers,
            title: legacy.title,
        },
        html: legacy.html.into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_length_prefixed_response() {
        let meta = serde_json::json!({"status_code": 200, "headers": {}, "title": "Hi"});
        let meta_bytes = serde_json::to_vec(&meta).unwrap();
        let mut raw = (meta_bytes.len() as u32).to_be_bytes().to_vec();
        raw.extend_from_slice(&meta_bytes);
        raw.extend_from_slice(b"<html></html>");

        let outcome = decode_length_prefixed(&raw).unwrap();
        assert_eq!(outcome.meta.status_code, 200);
        assert_eq!(outcome.meta.title.as_deref(), Some("Hi"));
        assert_eq!(outcome.html, b"<html></html>");
    }

    #[test]
    fn rejects_truncated_response() {
        assert!(decode_length_prefixed(&[0, 0, 0, 10, 1, 2]).is_err());
    }

    #[test]
    fn decodes_legacy_json_fallback() {
        let raw = serde_json::json!({
            "status_code": 200,
            "headers": {"x-a": "1"},
            "html": "<p>hi</p>"
        })
        .to_string();
        let outcome = decode_legacy_json(raw.as_bytes()).unwrap();
        assert_eq!(outcome.html, b"<p>hi</p>");
        assert_eq!(outcome.meta.headers.get("x-a"), Some(&"1".to_string()));
    }
}
