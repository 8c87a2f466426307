//! RS tab manager (C10) and render-service registry: per-RS tab slot hash in
//! the shared directory, plus the `service:render:{id}` presence records C11
//! enumerates. Registry shape mirrors the teacher's `proxy/health_check.rs`
//! (scan a prefix, deserialize, filter to healthy) applied to render workers
//! instead of upstream nodes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::directory::Directory;
use crate::error::{GatewayError, GatewayResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Draining,
    Unhealthy,
}

/// ServiceInfo (§3): one Render Service's directory presence record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub capacity: u32,
    pub load: u32,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn service_key(id: &str) -> String {
    format!("service:render:{id}")
}

fn tabs_key(rs_id: &str) -> String {
    format!("tabs:{rs_id}")
}

pub struct TabManager {
    directory: Arc<dyn Directory>,
    service_ttl_secs: i64,
}

impl TabManager {
    pub fn new(directory: Arc<dyn Directory>, service_ttl_secs: i64) -> Self {
        Self {
            directory,
            service_ttl_secs,
        }
    }

    pub async fn heartbeat_service(&self, info: &ServiceInfo) -> GatewayResult<()> {
        let payload = serde_json::to_string(info)
            .map_err(|e| GatewayError::InternalError(format!("service info encode: {e}")))?;
        self.directory
            .set_string(&service_key(&info.id), &payload, self.service_ttl_secs)
            .await
    }

    /// Enumerate `service:render:*`, filtered to healthy entries with free capacity.
    pub async fn healthy_services(&self) -> GatewayResult<Vec<ServiceInfo>> {
        let keys = self.directory.scan_prefix("service:render:").await?;
        let mut services = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.directory.get_string(&key).await? else {
                continue;
            };
            let Ok(info) = serde_json::from_str::<ServiceInfo>(&raw) else {
                continue;
            };
            if info.status == ServiceStatus::Healthy && info.capacity > 0 {
                services.push(info);
            }
        }
        Ok(services)
    }

    /// Initializes all `capacity` fields of `tabs:{rs_id}` to empty on startup.
    pub async fn register_tabs(&self, rs_id: &str, capacity: u32, ttl_secs: i64) -> GatewayResult<()> {
        let fields: Vec<(String, String)> = (0..capacity).map(|i| (i.to_string(), String::new())).collect();
        self.directory.hash_set_all(&tabs_key(rs_id), &fields, ttl_secs).await
    }

    /// Keeps `tabs:{rs_id}` alive. If the key survived, just refresh its TTL;
    /// if the shared directory evicted it, recreate it from the RS's own
    /// in-memory occupancy so no reservation is silently forgotten.
    pub async fn sync_tabs(
        &self,
        rs_id: &str,
        capacity: u32,
        occupancy: &HashMap<u32, String>,
        ttl_secs: i64,
    ) -> GatewayResult<()> {
        let key = tabs_key(rs_id);
        if self.directory.exists(&key).await? {
            self.directory.expire(&key, ttl_secs).await?;
            return Ok(());
        }
        let fields: Vec<(String, String)> = (0..capacity)
            .map(|i| (i.to_string(), occupancy.get(&i).cloned().unwrap_or_default()))
            .collect();
        self.directory.hash_set_all(&key, &fields, ttl_secs).await
    }

    pub async fn release_tab(&self, rs_id: &str, tab_index: u32) -> GatewayResult<()> {
        self.directory.release_tab(rs_id, tab_index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;

    fn sample_service(id: &str, capacity: u32) -> ServiceInfo {
        ServiceInfo {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            capacity,
            load: 0,
            status: ServiceStatus::Healthy,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn healthy_services_excludes_zero_capacity_and_unhealthy() {
        let dir = Arc::new(MemoryDirectory::new());
        let tabs = TabManager::new(dir, 10);
        tabs.heartbeat_service(&sample_service("rs-1", 4)).await.unwrap();

        let mut zero_cap = sample_service("rs-2", 0);
        zero_cap.capacity = 0;
        tabs.heartbeat_service(&zero_cap).await.unwrap();

        let mut unhealthy = sample_service("rs-3", 4);
        unhealthy.status = ServiceStatus::Unhealthy;
        tabs.heartbeat_service(&unhealthy).await.unwrap();

        let healthy = tabs.healthy_services().await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "rs-1");
    }

    #[tokio::test]
    async fn register_tabs_initializes_all_fields_empty() {
        let dir = Arc::new(MemoryDirectory::new());
        let tabs = TabManager::new(dir.clone(), 10);
        tabs.register_tabs("rs-1", 3, 30).await.unwrap();
        let fields = dir.hash_get_all("tabs:rs-1").await.unwrap();
        assert_eq!(fields.len(), 3);
        assert!(fields.iter().all(|(_, v)| v.is_empty()));
    }

    #[tokio::test]
    async fn sync_tabs_recreates_from_occupancy_when_evicted() {
        let dir = Arc::new(MemoryDirectory::new());
        let tabs = TabManager::new(dir.clone(), 10);
        let mut occupancy = HashMap::new();
        occupancy.insert(1u32, "req-42".to_string());

        tabs.sync_tabs("rs-1", 2, &occupancy, 5).await.unwrap();
        let value = dir.hash_get("tabs:rs-1", "1").await.unwrap();
        assert_eq!(value.as_deref(), Some("req-42"));
    }
}
