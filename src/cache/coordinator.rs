//! Cache coordinator (C9): local-first lookup, cross-EG pull-on-miss with
//! replication fan-out, and push-on-render (§4.8). Outbound peer calls use
//! `reqwest`, the same client this crate uses for the bypass fetcher (C13)
//! and the render-service dispatch (C12) — one HTTP client story for every
//! outbound call the gateway makes, none of it routed through pingora's
//! upstream-peer proxying (that machinery is for the teacher's pass-through
//! traffic, not for a node that serves responses it assembles itself).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::cache::meta::{now_unix, CacheMetadata, MetadataStore};
use crate::cache::fs::FsCache;
use crate::cluster::ClusterRegistry;
use crate::config::CompressionAlgorithm;
use crate::error::{GatewayError, GatewayResult};
use crate::shard;

pub struct CacheCoordinator {
    meta_store: Arc<MetadataStore>,
    fs_cache: Arc<FsCache>,
    cluster: Arc<ClusterRegistry>,
    http_client: reqwest::Client,
    self_eg_id: String,
    internal_bearer_key: String,
}

/// Outcome of a read attempt through the coordinator.
pub enum LookupOutcome {
    Hit { meta: CacheMetadata, body: Vec<u8> },
    Miss,
}

impl CacheCoordinator {
    pub fn new(
        meta_store: Arc<MetadataStore>,
        fs_cache: Arc<FsCache>,
        cluster: Arc<ClusterRegistry>,
        self_eg_id: String,
        internal_bearer_key: String,
    ) -> Self {
        Self {
            meta_store,
            fs_cache,
            cluster,
            http_client: reqwest::Client::new(),
            self_eg_id,
            internal_bearer_key,
        }
    }

    /// §4.8 read path: local directory lookup first; on miss with sharding
    /// enabled, pull from peer owners in rendezvous order.
    pub async fn lookup(
        &self,
        cache_key: &str,
        sharding_enabled: bool,
        replication_factor: usize,
        replicate_on_pull: bool,
    ) -> GatewayResult<LookupOutcome> {
        if let Some(outcome) = self.lookup_local(cache_key).await? {
            return Ok(outcome);
        }

        if !sharding_enabled {
            return Ok(LookupOutcome::Miss);
        }

        let healthy = self.cluster.get_healthy_egs().await?;
        let healthy_ids: Vec<String> = healthy.iter().map(|e| e.eg_id.clone()).collect();
        let owner_ids = shard::owners(cache_key, &healthy_ids, replication_factor);

        let mut remaining: Vec<&crate::cluster::EgInfo> = Vec::new();
        for owner_id in &owner_ids {
            if *owner_id == self.self_eg_id {
                continue;
            }
            let Some(peer) = healthy.iter().find(|e| &e.eg_id == owner_id) else {
                continue;
            };
            remaining.push(peer);
        }

        for (i, peer) in remaining.iter().enumerate() {
            match self.pull_from(peer, cache_key).await {
                Ok(Some((meta, body))) => {
                    self.fs_cache
                        .write(&meta.file_path, &body, CompressionAlgorithm::None)
                        .await
                        .ok();
                    if let Err(e) = self.meta_store.put(&meta).await {
                        log::warn!(cache_key = cache_key, error:? = e; "failed to persist pulled metadata");
                    }

                    if replicate_on_pull && replication_factor > 1 {
                        let rest: Vec<&crate::cluster::EgInfo> = remaining
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, p)| *p)
                            .collect();
                        self.fan_out_push(&meta, &body, &rest).await;
                    }

                    return Ok(LookupOutcome::Hit { meta, body });
                }
                Ok(None) => continue,
                Err(e) => {
                    log::warn!(cache_key = cache_key, peer = peer.eg_id.as_str(), error:? = e; "cache pull failed");
                    continue;
                }
            }
        }

        Ok(LookupOutcome::Miss)
    }

    /// Local-only read. A hit whose file fails to decompress is treated as a
    /// miss and the stale metadata row is removed (§4.11 CACHE_LOOKUP).
    pub async fn lookup_local(&self, cache_key: &str) -> GatewayResult<Option<LookupOutcome>> {
        let Some(meta) = self.meta_store.get(cache_key).await? else {
            return Ok(None);
        };
        match self.fs_cache.read(&meta.file_path).await {
            Ok(body) => {
                self.meta_store.touch_last_access(cache_key).await.ok();
                Ok(Some(LookupOutcome::Hit { meta, body }))
            }
            Err(GatewayError::DecompressionError) => {
                self.meta_store.delete(cache_key).await.ok();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// §4.8 write path: persist locally, then fan out push to remaining
    /// owners if `push_on_render` is set. Replication failures are logged,
    /// never surfaced to the caller.
    pub async fn store(
        &self,
        meta: &CacheMetadata,
        body: &[u8],
        algorithm: CompressionAlgorithm,
        sharding_enabled: bool,
        push_on_render: bool,
        replication_factor: usize,
    ) -> GatewayResult<()> {
        self.fs_cache.write(&meta.file_path, body, algorithm).await?;
        self.meta_store.put(meta).await?;

        if !sharding_enabled || !push_on_render || replication_factor <= 1 {
            return Ok(());
        }

        let healthy = self.cluster.get_healthy_egs().await?;
        let healthy_ids: Vec<String> = healthy.iter().map(|e| e.eg_id.clone()).collect();
        let owner_ids = shard::owners(&meta.key, &healthy_ids, replication_factor);
        let peers: Vec<&crate::cluster::EgInfo> = owner_ids
            .iter()
            .filter(|id| **id != self.self_eg_id)
            .filter_map(|id| healthy.iter().find(|e| &e.eg_id == id))
            .collect();

        self.fan_out_push(meta, body, &peers).await;
        Ok(())
    }

    /// Apply an incoming push from a peer EG: write the body then the meta
    /// locally, exactly as a local render would.
    pub async fn receive_push(&self, meta: &CacheMetadata, body: &[u8]) -> GatewayResult<()> {
        self.fs_cache.write(&meta.file_path, body, CompressionAlgorithm::None).await?;
        self.meta_store.put(meta).await
    }

    async fn pull_from(
        &self,
        peer: &crate::cluster::EgInfo,
        cache_key: &str,
    ) -> GatewayResult<Option<(CacheMetadata, Vec<u8>)>> {
        let url = format!(
            "http://{}:{}/internal/cache/pull?cache_key={}",
            peer.address,
            peer.port,
            urlencoding_encode(cache_key)
        );
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.internal_bearer_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GatewayError::InternalError(format!("pull request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GatewayError::InternalError(format!(
                "pull from {} returned {}",
                peer.eg_id,
                response.status()
            )));
        }

        let meta_header = response
            .headers()
            .get("X-Shard-Metadata")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::InternalError("pull response missing X-Shard-Metadata".to_string()))?
            .to_string();
        let meta: CacheMetadata = parse_shard_metadata(&meta_header, cache_key)?;

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::InternalError(format!("pull body read failed: {e}")))?
            .to_vec();

        Ok(Some((meta, body)))
    }

    async fn fan_out_push(&self, meta: &CacheMetadata, body: &[u8], peers: &[&crate::cluster::EgInfo]) {
        let tasks = peers.iter().map(|peer| {
            let url = format!("http://{}:{}/internal/cache/push", peer.address, peer.port);
            let meta_header = shard_metadata_header(meta);
            let body = body.to_vec();
            let client = self.http_client.clone();
            let bearer = self.internal_bearer_key.clone();
            let eg_id = peer.eg_id.clone();
            async move {
                let result = client
                    .post(&url)
                    .bearer_auth(&bearer)
                    .header("X-Shard-Metadata", meta_header)
                    .timeout(Duration::from_secs(5))
                    .body(body)
                    .send()
                    .await;
                if let Err(e) = result {
                    log::warn!(peer = eg_id.as_str(), error:? = e; "replication push failed");
                }
            }
        });
        join_all(tasks).await;
    }
}

fn shard_metadata_header(meta: &CacheMetadata) -> String {
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

pub fn parse_shard_metadata(raw: &str, expected_key: &str) -> GatewayResult<CacheMetadata> {
    let v: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::InternalError(format!("bad shard metadata json: {e}")))?;

    let get_str = |k: &str| v.get(k).and_then(|x| x.as_str()).map(str::to_string);
    let get_i64 = |k: &str| v.get(k).and_then(|x| x.as_i64());
    let get_u64 = |k: &str| v.get(k).and_then(|x| x.as_u64());

    let headers: HashMap<String, String> = v
        .get("headers")
        .and_then(|h| serde_json::from_value(h.clone()).ok())
        .unwrap_or_default();
    let owning_eg_ids: Vec<String> = v
        .get("owning_eg_ids")
        .and_then(|o| serde_json::from_value(o.clone()).ok())
        .unwrap_or_default();

    Ok(CacheMetadata {
        key: get_str("key").unwrap_or_else(|| expected_key.to_string()),
        source_url: get_str("source_url").unwrap_or_default(),
        canonical_url: get_str("canonical_url").unwrap_or_default(),
        file_path: get_str("file_path")
            .ok_or_else(|| GatewayError::InternalError("shard metadata missing file_path".to_string()))?,
        created_at: get_i64("created_at").unwrap_or_else(now_unix),
        expires_at: get_i64("expires_at").unwrap_or_else(now_unix),
        stale_ttl_secs: get_i64("stale_ttl_secs").unwrap_or(0),
        last_access: get_i64("last_access").unwrap_or_else(now_unix),
        logical_size: get_u64("logical_size").unwrap_or(0),
        on_disk_size: get_u64("on_disk_size").unwrap_or(0),
        source_tag: get_str("source_tag")
            .and_then(|s| crate::cache::SourceTag::parse(&s))
            .unwrap_or(crate::cache::SourceTag::Render),
        origin_status_code: v
            .get("origin_status_code")
            .and_then(|x| x.as_u64())
            .map(|x| x as u16)
            .unwrap_or(200),
        headers,
        owning_eg_ids,
        last_bot_hit: get_i64("last_bot_hit"),
        index_status: get_str("index_status"),
        title: get_str("title"),
    })
}

fn urlencoding_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceTag;

    fn sample_meta() -> CacheMetadata {
        CacheMetadata {
            key: "cache:1:1:abc".to_string(),
            source_url: "https://example.com/a".to_string(),
            canonical_url: "https://example.com/a".to_string(),
            file_path: "1/2024/01/01/00/00/abc_1.html".to_string(),
            created_at: 1_700_000_000,
            expires_at: 1_700_003_600,
            stale_ttl_secs: 300,
            last_access: 1_700_000_000,
            logical_size: 10,
            on_disk_size: 10,
            source_tag: SourceTag::Render,
            origin_status_code: 200,
            headers: HashMap::new(),
            owning_eg_ids: vec!["eg-1".to_string()],
            last_bot_hit: None,
            index_status: None,
            title: None,
        }
    }

    #[test]
    fn shard_metadata_roundtrips_through_header_encoding() {
        let meta = sample_meta();
        let header = shard_metadata_header(&meta);
        let parsed = parse_shard_metadata(&header, &meta.key).unwrap();
        assert_eq!(parsed.key, meta.key);
        assert_eq!(parsed.file_path, meta.file_path);
        assert_eq!(parsed.expires_at, meta.expires_at);
    }
}
