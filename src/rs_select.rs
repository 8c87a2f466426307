//! RS selection (C11): pick a healthy render service by strategy and reserve
//! one free tab, atomically, via the directory's `select_and_reserve_tab`
//! script (§4.10). The healthy-set enumeration is a plain read done before
//! the atomic call — only the tab-hash mutation itself needs script atomicity.

use std::sync::Arc;

use crate::directory::{Directory, TabSelectStrategy};
use crate::error::{GatewayError, GatewayResult};
use crate::tabs::{ServiceInfo, TabManager};

/// Outcome of a reservation attempt (§4.10 step 3).
#[derive(Debug)]
pub enum SelectOutcome {
    Reserved {
        rs_id: String,
        tab_index: u32,
        address: String,
        port: u16,
    },
    NoCapacity,
    NoServices,
}

pub struct RsSelector {
    directory: Arc<dyn Directory>,
    tabs: Arc<TabManager>,
}

impl RsSelector {
    pub fn new(directory: Arc<dyn Directory>, tabs: Arc<TabManager>) -> Self {
        Self { directory, tabs }
    }

    pub async fn select_and_reserve(
        &self,
        request_id: &str,
        strategy: TabSelectStrategy,
        reservation_ttl_secs: i64,
    ) -> GatewayResult<SelectOutcome> {
        let services = self.tabs.healthy_services().await?;
        if services.is_empty() {
            return Ok(SelectOutcome::NoServices);
        }

        let rs_ids: Vec<String> = services.iter().map(|s| s.id.clone()).collect();
        let capacities: Vec<u32> = services.iter().map(|s| s.capacity).collect();

        let reservation = self
            .directory
            .select_and_reserve_tab(&rs_ids, &capacities, strategy, request_id, reservation_ttl_secs)
            .await?;

        match reservation {
            None => Ok(SelectOutcome::NoCapacity),
            Some((rs_id, tab_index)) => {
                let info = find_service(&services, &rs_id).ok_or_else(|| {
                    GatewayError::InternalError(format!("reserved tab on unknown service '{rs_id}'"))
                })?;
                Ok(SelectOutcome::Reserved {
                    rs_id,
                    tab_index,
                    address: info.address.clone(),
                    port: info.port,
                })
            }
        }
    }

    pub async fn release(&self, rs_id: &str, tab_index: u32) -> GatewayResult<()> {
        self.tabs.release_tab(rs_id, tab_index).await
    }

    /// Sum of `capacity` across healthy services — the budgeting input for
    /// the recache scheduler (C15 step 1), not used by request-path selection.
    pub async fn total_capacity(&self) -> GatewayResult<u32> {
        Ok(self.tabs.healthy_services().await?.iter().map(|s| s.capacity).sum())
    }
}

fn find_service<'a>(services: &'a [ServiceInfo], id: &str) -> Option<&'a ServiceInfo> {
    services.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;
    use crate::tabs::ServiceStatus;
    use std::collections::HashMap;

    async fn setup() -> (RsSelector, Arc<MemoryDirectory>) {
        let dir = Arc::new(MemoryDirectory::new());
        let tabs = Arc::new(TabManager::new(dir.clone(), 10));
        tabs.heartbeat_service(&ServiceInfo {
            id: "rs-1".to_string(),
            address: "10.0.0.1".to_string(),
            port: 9000,
            capacity: 1,
            load: 0,
            status: ServiceStatus::Healthy,
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
        tabs.register_tabs("rs-1", 1, 30).await.unwrap();
        (RsSelector::new(dir.clone(), tabs), dir)
    }

    #[tokio::test]
    async fn no_services_is_distinguished_from_no_capacity() {
        let dir = Arc::new(MemoryDirectory::new());
        let tabs = Arc::new(TabManager::new(dir.clone(), 10));
        let selector = RsSelector::new(dir, tabs);
        let outcome = selector
            .select_and_reserve("req-1", TabSelectStrategy::LeastLoaded, 5)
            .await
            .unwrap();
        assert!(matches!(outcome, SelectOutcome::NoServices));
    }

    #[tokio::test]
    async fn reserves_the_only_free_tab_then_reports_no_capacity() {
        let (selector, _dir) = setup().await;
        let first = selector
            .select_and_reserve("req-1", TabSelectStrategy::LeastLoaded, 5)
            .await
            .unwrap();
        assert!(matches!(first, SelectOutcome::Reserved { .. }));

        let second = selector
            .select_and_reserve("req-2", TabSelectStrategy::LeastLoaded, 5)
            .await
            .unwrap();
        assert!(matches!(second, SelectOutcome::NoCapacity));
    }

    #[tokio::test]
    async fn release_frees_the_tab_for_reuse() {
        let (selector, _dir) = setup().await;
        let SelectOutcome::Reserved { rs_id, tab_index, .. } = selector
            .select_and_reserve("req-1", TabSelectStrategy::LeastLoaded, 5)
            .await
            .unwrap()
        else {
            panic!("expected reservation");
        };

        selector.release(&rs_id, tab_index).await.unwrap();

        let again = selector
            .select_and_reserve("req-2", TabSelectStrategy::LeastLoaded, 5)
            .await
            .unwrap();
        assert!(matches!(again, SelectOutcome::Reserved { .. }));
    }
}
