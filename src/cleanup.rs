//! Cleanup worker (C14): periodic deletion of expired cache directories
//! (§4.13). Walks the on-disk `{host}/{YYYY}/{MM}/{DD}/{HH}/{mm}` tree that
//! `FsCache::relative_path` lays out, deleting any minute directory older
//! than the host's retention window and pruning the now-empty parent chain.
//! Same periodic-tick idiom as the recache scheduler (C15) and the teacher's
//! health-check loop, but walking a filesystem tree instead of a registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tokio::fs;

use crate::cache::fs::FsCache;
use crate::cache::meta::now_unix;
use crate::config::CleanupConfig;
use crate::error::GatewayResult;
use crate::orchestrator::GatewayState;

pub struct CleanupWorker {
    state: Arc<GatewayState>,
    fs_cache: Arc<FsCache>,
    interval_ms: u64,
    safety_margin_secs: i64,
}

impl CleanupWorker {
    pub fn new(state: Arc<GatewayState>, fs_cache: Arc<FsCache>, config: CleanupConfig) -> Self {
        Self {
            state,
            fs_cache,
            interval_ms: config.interval_ms,
            safety_margin_secs: config.safety_margin_secs,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.interval_ms.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                log::warn!(error:? = e; "cleanup tick failed");
            }
        }
    }

    /// One full pass over every configured host (§4.13).
    pub async fn run_once(&self) -> GatewayResult<()> {
        let compiled = self.state.config.load_full();
        let now = now_unix();

        for host in compiled.raw.hosts.iter() {
            let host_stale = host
                .overrides
                .render_cache_stale_ttl_secs
                .unwrap_or(compiled.raw.defaults.render.cache_stale_ttl_secs)
                .max(0);
            let retention = host_stale + self.safety_margin_secs;
            self.sweep_host(host.id, now, retention).await;
        }
        Ok(())
    }

    async fn sweep_host(&self, host_id: u32, now: i64, retention_secs: i64) {
        let host_abs = self.fs_cache.base().join(host_id.to_string());

        for year in list_dirs(&host_abs).await {
            let year_abs = host_abs.join(&year);
            for month in list_dirs(&year_abs).await {
                let month_abs = year_abs.join(&month);
                for day in list_dirs(&month_abs).await {
                    let day_abs = month_abs.join(&day);
                    for hour in list_dirs(&day_abs).await {
                        let hour_abs = day_abs.join(&hour);
                        for minute in list_dirs(&hour_abs).await {
                            let Some(dir_time) = parse_dir_timestamp(&year, &month, &day, &hour, &minute) else {
                                log::warn!(
                                    host_id,
                                    year = year.as_str(), month = month.as_str(), day = day.as_str(),
                                    hour = hour.as_str(), minute = minute.as_str();
                                    "skipping implausible cache directory timestamp"
                                );
                                continue;
                            };
                            if dir_time >= now - retention_secs {
                                continue;
                            }

                            let minute_rel = format!("{host_id}/{year}/{month}/{day}/{hour}/{minute}");
                            if let Err(e) = self.fs_cache.remove_dir_all(&minute_rel).await {
                                log::warn!(host_id, path = minute_rel.as_str(), error:? = e; "cleanup failed to remove expired directory");
                                continue;
                            }
                            remove_if_empty(&hour_abs).await;
                            remove_if_empty(&day_abs).await;
                            remove_if_empty(&month_abs).await;
                            remove_if_empty(&year_abs).await;
                        }
                    }
                }
            }
        }
    }
}

async fn list_dirs(path: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(mut entries) = fs::read_dir(path).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else { continue };
        if file_type.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    out
}

async fn remove_if_empty(path: &Path) {
    let Ok(mut entries) = fs::read_dir(path).await else {
        return;
    };
    if matches!(entries.next_entry().await, Ok(Some(_))) {
        return;
    }
    fs::remove_dir(path).await.ok();
}

/// Parses the `{YYYY}/{MM}/{DD}/{HH}/{mm}` path components back into a UTC
/// unix timestamp, rejecting implausible values (§4.13, §8 invariant 9).
fn parse_dir_timestamp(year: &str, month: &str, day: &str, hour: &str, minute: &str) -> Option<i64> {
    if year.len() != 4 {
        return None;
    }
    let y: i32 = year.parse().ok()?;
    let mo: u32 = month.parse().ok()?;
    let d: u32 = day.parse().ok()?;
    let h: u32 = hour.parse().ok()?;
    let mi: u32 = minute.parse().ok()?;
    if !(1970..=9999).contains(&y) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(y, mo, d)?;
    let time = NaiveTime::from_hms_opt(h, mi, 0)?;
    let naive = NaiveDateTime::new(date, time);
    Some(Utc.from_utc_datetime(&naive).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::BypassFetcher;
    use crate::cache::coordinator::CacheCoordinator;
    use crate::cache::meta::MetadataStore;
    use crate::cluster::ClusterRegistry;
    use crate::config::resolver::CompiledConfig;
    use crate::config::{Config, Defaults, Host, RenderDefaults};
    use crate::directory::memory::MemoryDirectory;
    use crate::events::{EventEmitter, EventEmitterConfig};
    use crate::rs_select::RsSelector;
    use crate::tabs::TabManager;
    use arc_swap::ArcSwap;
    use chrono::{Datelike, Timelike};
    use std::sync::atomic::AtomicU64;

    fn make_state(hosts: Vec<Host>, stale_ttl_secs: i64) -> Arc<GatewayState> {
        let dir = Arc::new(MemoryDirectory::new());
        let meta_store = Arc::new(MetadataStore::new(dir.clone()));
        let fs_cache = Arc::new(FsCache::new(std::env::temp_dir().join("rendergate-cleanup-coord")));
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
            path: std::env::temp_dir().join("rendergate-cleanup-test-events.log"),
            template: "{request_id}".to_string(),
            max_size_mb: 0,
            max_backups: 0,
            compress_backups: false,
            channel_capacity: 16,
        }));

        let config = Config {
            hosts,
            defaults: Defaults {
                render: RenderDefaults { cache_stale_ttl_secs: stale_ttl_secs, ..Default::default() },
                ..Default::default()
            },
            ..Default::default()
        };

        Arc::new(GatewayState {
            self_eg_id: "eg-1".to_string(),
            config: ArcSwap::from_pointee(CompiledConfig::build(Arc::new(config))),
            directory: dir,
            meta_store,
            coordinator,
            cluster,
            tabs_ttl_secs: 10,
            rs_selector,
            render_client: crate::render_client::RenderClient::new(),
            bypass: BypassFetcher::new(false),
            events,
            event_template: "{request_id}".to_string(),
            single_flight_degraded_total: AtomicU64::new(0),
        })
    }

    fn sample_host() -> Host {
        Host {
            id: 1,
            domain: "example.com".to_string(),
            aliases: vec![],
            render_key: "k".to_string(),
            enabled: true,
            dimensions: vec![],
            url_rules: vec![],
            fallback_dimension_id: None,
            overrides: Default::default(),
        }
    }

    #[test]
    fn parses_valid_directory_timestamp() {
        let t = parse_dir_timestamp("2024", "01", "02", "03", "04").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap().timestamp());
    }

    #[test]
    fn rejects_implausible_directory_components() {
        assert!(parse_dir_timestamp("2024", "13", "02", "03", "04").is_none());
        assert!(parse_dir_timestamp("2024", "01", "32", "03", "04").is_none());
        assert!(parse_dir_timestamp("abcd", "01", "02", "03", "04").is_none());
        assert!(parse_dir_timestamp("24", "01", "02", "03", "04").is_none());
    }

    #[tokio::test]
    async fn deletes_expired_minute_directory_and_prunes_empty_parents() {
        let base = std::env::temp_dir().join(format!("rendergate-cleanup-{}", uuid::Uuid::new_v4()));
        let fs_cache = Arc::new(FsCache::new(&base));
        let state = make_state(vec![sample_host()], 0);
        let worker = CleanupWorker::new(state, fs_cache.clone(), CleanupConfig { interval_ms: 100, safety_margin_secs: 60, base_path: "ignored".to_string() });

        let expired_minute_utc = Utc.timestamp_opt(now_unix() - 7200, 0).unwrap();
        let rel = format!(
            "1/{:04}/{:02}/{:02}/{:02}/{:02}/somehash_1.html",
            expired_minute_utc.year(), expired_minute_utc.month(), expired_minute_utc.day(),
            expired_minute_utc.hour(), expired_minute_utc.minute()
        );
        fs_cache.write(&rel, b"expired body", crate::config::CompressionAlgorithm::None).await.unwrap();

        worker.run_once().await.unwrap();

        assert!(!fs_cache.exists(&rel).await.unwrap());
        assert!(!base.join("1").join(expired_minute_utc.year().to_string()).exists());

        let _ = tokio::fs::remove_dir_all(&base).await;
    }

    #[tokio::test]
    async fn retains_directory_within_retention_window() {
        let base = std::env::temp_dir().join(format!("rendergate-cleanup-{}", uuid::Uuid::new_v4()));
        let fs_cache = Arc::new(FsCache::new(&base));
        let state = make_state(vec![sample_host()], 300);
        let worker = CleanupWorker::new(state, fs_cache.clone(), CleanupConfig { interval_ms: 100, safety_margin_secs: 300, base_path: "ignored".to_string() });

        // dated now - (300 + 300 - 60) = within the retention window, must survive.
        let fresh_minute_utc = Utc.timestamp_opt(now_unix() - (300 + 300 - 60), 0).unwrap();
        let rel = format!(
            "1/{:04}/{:02}/{:02}/{:02}/{:02}/freshhash_1.html",
            fresh_minute_utc.year(), fresh_minute_utc.month(), fresh_minute_utc.day(),
            fresh_minute_utc.hour(), fresh_minute_utc.minute()
        );
        fs_cache.write(&rel, b"fresh body", crate::config::CompressionAlgorithm::None).await.unwrap();

        worker.run_once().await.unwrap();

        assert!(fs_cache.exists(&rel).await.unwrap());
        let _ = tokio::fs::remove_dir_all(&base).await;
    }
}
