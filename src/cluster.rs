//! Cluster registry (C7): EG presence via heartbeated directory keys, and
//! healthy-member enumeration for the shard router (C8). Same "scan a
//! registry prefix, keep a sorted, de-duplicated view" shape as the teacher's
//! `proxy/health_check.rs` upstream health registry, aimed at peer EGs
//! instead of upstream nodes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::directory::Directory;
use crate::error::{GatewayError, GatewayResult};

/// EGInfo (§3): one Edge Gateway's cluster presence record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EgInfo {
    pub eg_id: String,
    pub address: String,
    pub port: u16,
    pub last_heartbeat: i64,
    pub sharding_enabled: bool,
}

fn registry_key(eg_id: &str) -> String {
    format!("registry:eg:{eg_id}")
}

pub struct ClusterRegistry {
    directory: Arc<dyn Directory>,
    heartbeat_ttl_secs: i64,
}

impl ClusterRegistry {
    pub fn new(directory: Arc<dyn Directory>, heartbeat_ttl_secs: i64) -> Self {
        Self {
            directory,
            heartbeat_ttl_secs,
        }
    }

    /// Fails if a record already exists under this id — two EGs must not
    /// share an id concurrently.
    pub async fn register(&self, info: &EgInfo) -> GatewayResult<()> {
        let key = registry_key(&info.eg_id);
        if self.directory.exists(&key).await? {
            return Err(GatewayError::InternalError(format!(
                "eg id '{}' already registered",
                info.eg_id
            )));
        }
        self.write(info).await
    }

    /// Called every `heartbeat_interval` from the heartbeat loop; writes a
    /// fresh record with the fixed TTL regardless of whether one already exists.
    pub async fn heartbeat(&self, info: &EgInfo) -> GatewayResult<()> {
        self.write(info).await
    }

    async fn write(&self, info: &EgInfo) -> GatewayResult<()> {
        let payload = serde_json::to_string(info)
            .map_err(|e| GatewayError::InternalError(format!("eg info encode: {e}")))?;
        self.directory
            .set_string(&registry_key(&info.eg_id), &payload, self.heartbeat_ttl_secs)
            .await
    }

    /// Alphabetical-by-id list of sharding-enabled, live EGs. A crashed EG is
    /// invisible after its record's TTL expires (≤ 3 heartbeats, §4.6).
    pub async fn get_healthy_egs(&self) -> GatewayResult<Vec<EgInfo>> {
        let keys = self.directory.scan_prefix("registry:eg:").await?;
        let mut egs = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.directory.get_string(&key).await? else {
                continue;
            };
            let Ok(info) = serde_json::from_str::<EgInfo>(&raw) else {
                continue;
            };
            if info.sharding_enabled {
                egs.push(info);
            }
        }
        egs.sort_by(|a, b| a.eg_id.cmp(&b.eg_id));
        Ok(egs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;

    fn eg(id: &str) -> EgInfo {
        EgInfo {
            eg_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 8080,
            last_heartbeat: 0,
            sharding_enabled: true,
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicate_id() {
        let reg = ClusterRegistry::new(Arc::new(MemoryDirectory::new()), 3);
        reg.register(&eg("eg-1")).await.unwrap();
        assert!(reg.register(&eg("eg-1")).await.is_err());
    }

    #[tokio::test]
    async fn healthy_egs_are_sorted_and_filtered_to_sharding_enabled() {
        let reg = ClusterRegistry::new(Arc::new(MemoryDirectory::new()), 3);
        reg.register(&eg("eg-b")).await.unwrap();
        reg.register(&eg("eg-a")).await.unwrap();
        let mut disabled = eg("eg-c");
        disabled.sharding_enabled = false;
        reg.register(&disabled).await.unwrap();

        let healthy = reg.get_healthy_egs().await.unwrap();
        let ids: Vec<&str> = healthy.iter().map(|e| e.eg_id.as_str()).collect();
        assert_eq!(ids, vec!["eg-a", "eg-b"]);
    }
}
