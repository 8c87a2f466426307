#![allow(clippy::upper_case_acronyms)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use pingora::server::{ListenFds, ShutdownWatch};
use pingora::services::listening::Service as ListeningService;
use pingora::services::Service;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use rendergate::admin::AdminApp;
use rendergate::bypass::BypassFetcher;
use rendergate::cache::coordinator::CacheCoordinator;
use rendergate::cache::fs::FsCache;
use rendergate::cache::meta::{now_unix, MetadataStore};
use rendergate::cleanup::CleanupWorker;
use rendergate::cluster::{ClusterRegistry, EgInfo};
use rendergate::config::resolver::CompiledConfig;
use rendergate::config::Config;
use rendergate::directory::redis_store::RedisDirectory;
use rendergate::directory::Directory;
use rendergate::events::{EventEmitter, EventEmitterConfig};
use rendergate::internal::InternalApp;
use rendergate::logging::Logger;
use rendergate::metrics::StatusHttpApp;
use rendergate::orchestrator::{GatewayState, RenderGateway};
use rendergate::recache::RecacheScheduler;
use rendergate::render_client::RenderClient;
use rendergate::rs_select::RsSelector;
use rendergate::tabs::TabManager;

fn main() {
    let opt = Opt::parse_args();
    let mut raw_config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");
    // Pulled out before `raw_config` is wrapped in an `Arc` below — pingora's
    // `Server` wants to own its `ServerConf`, and nothing past this point
    // needs rendergate's own config through this field.
    let pingora_conf = std::mem::take(&mut raw_config.pingora);
    let config = Arc::new(raw_config);

    let logger = Logger::new(config.gateway.log.clone());
    logger.init_env_logger();

    let rt = tokio::runtime::Runtime::new().expect("failed to build startup runtime");
    let state = rt.block_on(build_state(config.clone()));

    let mut pingsix_server = Server::new_with_opt_and_conf(Some(opt), pingora_conf);

    log::info!("Adding log sync service...");
    pingsix_server.add_service(logger);

    log::info!("Adding public render service...");
    let render_gateway = RenderGateway { state: state.clone() };
    let mut http_service = http_proxy_service_with_name(
        &pingsix_server.configuration,
        render_gateway,
        "rendergate",
    );
    http_service.add_tcp(&config.gateway.listen.to_string());
    pingsix_server.add_service(http_service);

    log::info!("Adding internal EG-to-EG service...");
    let internal_app = InternalApp::new(state.clone(), config.gateway.internal_bearer_key.clone());
    let mut internal_service = ListeningService::new("Internal HTTP".to_string(), internal_app);
    internal_service.add_tcp(&config.gateway.internal.address.to_string());
    pingsix_server.add_service(internal_service);

    if let Some(status_cfg) = &config.gateway.status {
        log::info!("Adding status/metrics service...");
        let status_app = StatusHttpApp::new(state.clone());
        let mut status_service = ListeningService::new("Status HTTP".to_string(), status_app);
        status_service.add_tcp(&status_cfg.address.to_string());
        pingsix_server.add_service(status_service);
    }

    log::info!("Adding recache scheduler...");
    let scheduler = RecacheScheduler::new(
        state.clone(),
        config.gateway.recache.clone(),
        config.gateway.eg_id.clone(),
        config.gateway.internal_bearer_key.clone(),
    );
    pingsix_server.add_service(RecacheSchedulerService(scheduler.clone()));

    if let (true, Some(admin_cfg)) = (config.gateway.scheduler_control_api, &config.gateway.admin) {
        log::info!("Adding admin control service...");
        let admin_app = AdminApp::new(state.clone(), scheduler.clone(), admin_cfg.api_key.clone());
        let mut admin_service = ListeningService::new("Admin HTTP".to_string(), admin_app);
        admin_service.add_tcp(&admin_cfg.address.to_string());
        pingsix_server.add_service(admin_service);
    }

    log::info!("Adding cleanup worker...");
    let fs_cache = Arc::new(FsCache::new(config.gateway.cleanup.base_path.clone()));
    let cleanup_worker = Arc::new(CleanupWorker::new(state.clone(), fs_cache, config.gateway.cleanup.clone()));
    pingsix_server.add_service(CleanupService(cleanup_worker));

    log::info!("Adding cluster heartbeat loop...");
    let eg_info = EgInfo {
        eg_id: config.gateway.eg_id.clone(),
        address: config.gateway.internal.address.ip().to_string(),
        port: config.gateway.internal.address.port(),
        last_heartbeat: now_unix(),
        sharding_enabled: config.defaults.sharding.enabled,
    };
    pingsix_server.add_service(HeartbeatService {
        cluster: state.cluster.clone(),
        info: eg_info,
        interval_ms: config.gateway.heartbeat_interval_ms,
    });

    log::info!("Bootstrapping...");
    pingsix_server.bootstrap();

    log::info!("Starting Server...");
    pingsix_server.run_forever();
}

/// Builds every shared, long-lived dependency once at startup and wraps it
/// in `GatewayState` (§9: "composed by dependency injection at startup").
async fn build_state(config: Arc<Config>) -> Arc<GatewayState> {
    let directory: Arc<dyn Directory> = Arc::new(
        RedisDirectory::connect(&config.gateway.directory.url)
            .await
            .expect("failed to connect to the shared directory"),
    );

    let meta_store = Arc::new(MetadataStore::new(directory.clone()));
    let fs_cache = Arc::new(FsCache::new(config.gateway.cleanup.base_path.clone()));
    let heartbeat_ttl_secs = (config.gateway.heartbeat_ttl_ms / 1000).max(1) as i64;
    let cluster = Arc::new(ClusterRegistry::new(directory.clone(), heartbeat_ttl_secs));
    let coordinator = Arc::new(CacheCoordinator::new(
        meta_store.clone(),
        fs_cache,
        cluster.clone(),
        config.gateway.eg_id.clone(),
        config.gateway.internal_bearer_key.clone(),
    ));

    let tabs = Arc::new(TabManager::new(directory.clone(), heartbeat_ttl_secs));
    let rs_selector = Arc::new(RsSelector::new(directory.clone(), tabs));

    let events = Arc::new(EventEmitter::spawn(EventEmitterConfig {
        path: config.gateway.event_log.path.clone().into(),
        template: config.gateway.event_log.template.clone(),
        max_size_mb: config.gateway.event_log.max_size_mb,
        max_backups: config.gateway.event_log.max_backups,
        compress_backups: config.gateway.event_log.compress_backups,
        channel_capacity: config.gateway.event_log.channel_capacity,
    }));

    Arc::new(GatewayState {
        self_eg_id: config.gateway.eg_id.clone(),
        config: ArcSwap::from_pointee(CompiledConfig::build(config.clone())),
        directory,
        meta_store,
        coordinator,
        cluster,
        tabs_ttl_secs: heartbeat_ttl_secs,
        rs_selector,
        render_client: RenderClient::new(),
        bypass: BypassFetcher::new(config.gateway.bypass_allow_private_targets),
        events,
        event_template: config.gateway.event_log.template.clone(),
        single_flight_degraded_total: AtomicU64::new(0),
    })
}

/// Heartbeats this EG's presence into the shared directory (§4.6). Registers
/// once at startup — a collision there just means a previous instance's
/// record hasn't expired yet, so the loop heartbeats through it regardless.
struct HeartbeatService {
    cluster: Arc<ClusterRegistry>,
    info: EgInfo,
    interval_ms: u64,
}

#[async_trait]
impl Service for HeartbeatService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        if let Err(e) = self.cluster.register(&self.info).await {
            log::warn!(eg_id = self.info.eg_id.as_str(), error:? = e; "eg registration collided with an existing record, heartbeating anyway");
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.interval_ms.max(1)));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown signal received, stopping heartbeat loop");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.info.last_heartbeat = now_unix();
                    if let Err(e) = self.cluster.heartbeat(&self.info).await {
                        log::warn!(eg_id = self.info.eg_id.as_str(), error:? = e; "heartbeat failed");
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "eg heartbeat"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

struct CleanupService(Arc<CleanupWorker>);

#[async_trait]
impl Service for CleanupService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, _shutdown: ShutdownWatch) {
        self.0.clone().run().await;
    }

    fn name(&self) -> &'static str {
        "cleanup worker"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

struct RecacheSchedulerService(Arc<RecacheScheduler>);

#[async_trait]
impl Service for RecacheSchedulerService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, _shutdown: ShutdownWatch) {
        self.0.clone().run().await;
    }

    fn name(&self) -> &'static str {
        "recache scheduler"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
