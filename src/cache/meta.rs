//! Cache metadata store (C5): per-key metadata record in the directory with
//! TTL (§4.4), plus the distributed lock operations C12 drives single-flight
//! render with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::SourceTag;
use crate::directory::{Directory, LockOutcome};
use crate::error::{GatewayError, GatewayResult};

/// A cached artifact's metadata record (§3).
#[derive(Clone, Debug)]
pub struct CacheMetadata {
    pub key: String,
    pub source_url: String,
    pub canonical_url: String,
    pub file_path: String,
    pub created_at: i64,
    pub expires_at: i64,
    /// Extra seconds beyond `expires_at` the directory row (and the stale
    /// artifact itself) stay valid for stale-while-revalidate serving
    /// (§4.11 STALE SERVE). Part of the record, not a call-site parameter,
    /// so every path that re-persists metadata carries it forward unchanged.
    pub stale_ttl_secs: i64,
    pub last_access: i64,
    pub logical_size: u64,
    pub on_disk_size: u64,
    pub source_tag: SourceTag,
    pub origin_status_code: u16,
    pub headers: HashMap<String, String>,
    pub owning_eg_ids: Vec<String>,
    pub last_bot_hit: Option<i64>,
    pub index_status: Option<String>,
    pub title: Option<String>,
}

impl CacheMetadata {
    pub fn effective_ttl_secs(&self) -> i64 {
        (self.expires_at - self.created_at) + self.stale_ttl_secs
    }

    fn to_fields(&self) -> GatewayResult<Vec<(String, String)>> {
        let mut owners = self.owning_eg_ids.clone();
        owners.sort();
        owners.dedup();

        let headers_json = serde_json::to_string(&self.headers)
            .map_err(|e| GatewayError::InternalError(format!("metadata encode: {e}")))?;

        Ok(vec![
            ("source_url".to_string(), self.source_url.clone()),
            ("canonical_url".to_string(), self.canonical_url.clone()),
            ("file_path".to_string(), self.file_path.clone()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("expires_at".to_string(), self.expires_at.to_string()),
            ("stale_ttl_secs".to_string(), self.stale_ttl_secs.to_string()),
            ("last_access".to_string(), self.last_access.to_string()),
            ("logical_size".to_string(), self.logical_size.to_string()),
            ("on_disk_size".to_string(), self.on_disk_size.to_string()),
            ("source_tag".to_string(), self.source_tag.as_str().to_string()),
            (
                "origin_status_code".to_string(),
                self.origin_status_code.to_string(),
            ),
            ("headers".to_string(), headers_json),
            ("owning_eg_ids".to_string(), owners.join(",")),
            (
                "last_bot_hit".to_string(),
                self.last_bot_hit.map(|t| t.to_string()).unwrap_or_default(),
            ),
            (
                "index_status".to_string(),
                self.index_status.clone().unwrap_or_default(),
            ),
            ("title".to_string(), self.title.clone().unwrap_or_default()),
        ])
    }

    fn from_fields(key: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let get = |k: &str| fields.get(k).cloned();
        let get_i64 = |k: &str| get(k)?.parse::<i64>().ok();
        let get_u64 = |k: &str| get(k)?.parse::<u64>().ok();

        let headers = get("headers")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Some(CacheMetadata {
            key: key.to_string(),
            source_url: get("source_url")?,
            canonical_url: get("canonical_url")?,
            file_path: get("file_path")?,
            created_at: get_i64("created_at")?,
            expires_at: get_i64("expires_at")?,
            stale_ttl_secs: get_i64("stale_ttl_secs").unwrap_or(0),
            last_access: get_i64("last_access")?,
            logical_size: get_u64("logical_size").unwrap_or(0),
            on_disk_size: get_u64("on_disk_size").unwrap_or(0),
            source_tag: get("source_tag").and_then(|s| SourceTag::parse(&s)).unwrap_or(SourceTag::Render),
            origin_status_code: get("origin_status_code")
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),
            headers,
            owning_eg_ids: get("owning_eg_ids")
                .map(|s| s.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            last_bot_hit: get("last_bot_hit").and_then(|s| s.parse().ok()),
            index_status: get("index_status").filter(|s| !s.is_empty()),
            title: get("title").filter(|s| !s.is_empty()),
        })
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

pub struct MetadataStore {
    directory: Arc<dyn Directory>,
}

impl MetadataStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub async fn get(&self, cache_key: &str) -> GatewayResult<Option<CacheMetadata>> {
        let fields = self.directory.hash_get_all(cache_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let map: HashMap<String, String> = fields.into_iter().collect();
        Ok(CacheMetadata::from_fields(cache_key, &map))
    }

    /// Refuses (§8 invariant 4) to persist metadata whose effective TTL ≤ 0.
    pub async fn put(&self, meta: &CacheMetadata) -> GatewayResult<()> {
        let ttl = meta.effective_ttl_secs();
        if ttl <= 0 {
            return Err(GatewayError::ConfigurationError(
                "refusing to persist cache metadata with ttl + stale_ttl <= 0".to_string(),
            ));
        }
        let fields = meta.to_fields()?;
        self.directory.hash_set_all(&meta.key, &fields, ttl).await
    }

    pub async fn delete(&self, cache_key: &str) -> GatewayResult<()> {
        self.directory.delete(cache_key).await
    }

    pub async fn update_field(&self, cache_key: &str, field: &str, value: &str) -> GatewayResult<()> {
        self.directory.hash_set_field(cache_key, field, value).await
    }

    pub async fn touch_last_access(&self, cache_key: &str) -> GatewayResult<()> {
        self.update_field(cache_key, "last_access", &now_unix().to_string()).await
    }

    pub async fn acquire_lock(&self, cache_key: &str, owner: &str, ttl_secs: i64) -> GatewayResult<bool> {
        let outcome = self
            .directory
            .set_nx(&format!("lock:{cache_key}"), owner, ttl_secs)
            .await?;
        Ok(outcome == LockOutcome::Acquired)
    }

    pub async fn release_lock(&self, cache_key: &str) -> GatewayResult<()> {
        self.directory.delete(&format!("lock:{cache_key}")).await
    }

    pub async fn lock_held(&self, cache_key: &str) -> GatewayResult<bool> {
        self.directory.exists(&format!("lock:{cache_key}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;

    fn sample_meta(key: &str) -> CacheMetadata {
        let now = now_unix();
        CacheMetadata {
            key: key.to_string(),
            source_url: "https://example.com/a".to_string(),
            canonical_url: "https://example.com/a".to_string(),
            file_path: "1/2024/01/01/00/00/abc_1.html".to_string(),
            created_at: now,
            expires_at: now + 3600,
            stale_ttl_secs: 300,
            last_access: now,
            logical_size: 100,
            on_disk_size: 80,
            source_tag: SourceTag::Render,
            origin_status_code: 200,
            headers: HashMap::new(),
            owning_eg_ids: vec!["eg-2".to_string(), "eg-1".to_string(), "eg-1".to_string()],
            last_bot_hit: None,
            index_status: None,
            title: Some("Example".to_string()),
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MetadataStore::new(Arc::new(MemoryDirectory::new()));
        let meta = sample_meta("cache:1:1:abc");
        store.put(&meta).await.unwrap();

        let fetched = store.get("cache:1:1:abc").await.unwrap().unwrap();
        assert_eq!(fetched.source_url, meta.source_url);
        assert_eq!(fetched.owning_eg_ids, vec!["eg-1".to_string(), "eg-2".to_string()]);
        assert_eq!(fetched.title.as_deref(), Some("Example"));
    }

    #[tokio::test]
    async fn refuses_non_positive_effective_ttl() {
        let store = MetadataStore::new(Arc::new(MemoryDirectory::new()));
        let mut meta = sample_meta("cache:1:1:zero");
        meta.expires_at = meta.created_at;
        meta.stale_ttl_secs = 0;
        assert!(store.put(&meta).await.is_err());
        assert!(store.get("cache:1:1:zero").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let store = MetadataStore::new(Arc::new(MemoryDirectory::new()));
        assert!(store.acquire_lock("cache:1:1:abc", "req-1", 10).await.unwrap());
        assert!(!store.acquire_lock("cache:1:1:abc", "req-2", 10).await.unwrap());
        store.release_lock("cache:1:1:abc").await.unwrap();
        assert!(store.acquire_lock("cache:1:1:abc", "req-3", 10).await.unwrap());
    }
}
