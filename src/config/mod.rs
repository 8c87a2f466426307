//! Configuration tree: global defaults, hosts, dimensions and URL rules (§3),
//! loaded from YAML with `serde_yaml` + `validator`, the way the teacher's
//! `Config` loads and validates its resource lists.

pub mod resolver;

use std::{collections::HashMap, fs, net::SocketAddr, time::Duration};

use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Root configuration structure: pingora framework config plus rendergate settings.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_listener_ports"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub gateway: Gateway,

    #[validate(nested)]
    #[serde(default)]
    pub hosts: Vec<Host>,

    #[validate(nested)]
    #[serde(default)]
    pub defaults: Defaults,
}

impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .or_err_with(ReadError, || format!("Unable to read conf file from {path}"))?;
        Self::from_yaml(&conf_str)
    }

    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        let conf: Config = serde_yaml::from_str(conf_str)
            .or_err_with(ReadError, || format!("Unable to parse yaml conf {conf_str}"))?;

        conf.validate()
            .or_err_with(FileReadError, || "Conf file validation failed")?;

        let mut seen = std::collections::HashSet::new();
        for host in &conf.hosts {
            if !seen.insert(host.id) {
                return Error::e_explain(
                    FileReadError,
                    format!("Duplicate host id found: {}", host.id),
                );
            }
        }

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    /// Look up a host by exact domain or alias match, lowercased.
    pub fn find_host(&self, domain: &str) -> Option<&Host> {
        let domain = domain.to_ascii_lowercase();
        self.hosts
            .iter()
            .find(|h| h.enabled && (h.domain == domain || h.aliases.iter().any(|a| a == &domain)))
    }

    /// §6: every listener port must be in `[1, 65535]` (port `0` binds an
    /// arbitrary ephemeral port rather than failing loudly) and the
    /// status/metrics listener must not collide with the render or any other
    /// fixed listener's port.
    fn validate_listener_ports(&self) -> std::result::Result<(), ValidationError> {
        let mut named_ports: Vec<(&'static str, u16)> = vec![
            ("listen", self.gateway.listen.port()),
            ("internal", self.gateway.internal.address.port()),
        ];
        if let Some(status) = &self.gateway.status {
            named_ports.push(("status", status.address.port()));
        }
        if let Some(admin) = &self.gateway.admin {
            named_ports.push(("admin", admin.address.port()));
        }

        if named_ports.iter().any(|(_, port)| *port == 0) {
            return Err(ValidationError::new("listener_port_out_of_range"));
        }

        for i in 0..named_ports.len() {
            for j in (i + 1)..named_ports.len() {
                if named_ports[i].1 == named_ports[j].1 {
                    return Err(ValidationError::new("listener_port_collision"));
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    pub eg_id: String,
    pub listen: SocketAddr,
    #[validate(nested)]
    pub internal: InternalListener,
    #[validate(nested)]
    pub admin: Option<Admin>,
    #[validate(nested)]
    pub status: Option<Status>,
    #[validate(nested)]
    pub directory: DirectoryConfig,
    #[validate(nested)]
    pub log: Log,
    #[validate(nested)]
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub internal_bearer_key: String,
    #[serde(default = "Gateway::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "Gateway::default_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,
    #[validate(nested)]
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[validate(nested)]
    #[serde(default)]
    pub recache: RecacheConfig,
    #[serde(default)]
    pub scheduler_control_api: bool,
    /// Explicit SSRF-guard opt-out for the bypass fetcher (§4.12). Off unless
    /// a deployment deliberately serves hosts that resolve to private ranges.
    #[serde(default)]
    pub bypass_allow_private_targets: bool,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            eg_id: "eg-1".to_string(),
            listen: "0.0.0.0:8080".parse().unwrap(),
            internal: InternalListener::default(),
            admin: None,
            status: None,
            directory: DirectoryConfig::default(),
            log: Log::default(),
            event_log: EventLogConfig::default(),
            internal_bearer_key: String::new(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            heartbeat_ttl_ms: Self::default_heartbeat_ttl_ms(),
            cleanup: CleanupConfig::default(),
            recache: RecacheConfig::default(),
            scheduler_control_api: false,
            bypass_allow_private_targets: false,
        }
    }
}

impl Gateway {
    fn default_heartbeat_interval_ms() -> u64 {
        1000
    }
    fn default_heartbeat_ttl_ms() -> u64 {
        3000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct InternalListener {
    pub address: SocketAddr,
}

impl Default for InternalListener {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9091".parse().unwrap(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct DirectoryConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default = "DirectoryConfig::default_pool_size")]
    pub pool_size: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: Self::default_pool_size(),
        }
    }
}

impl DirectoryConfig {
    fn default_pool_size() -> u32 {
        8
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1), custom(function = "Log::validate_path"))]
    pub path: String,
    #[serde(default = "Log::default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "Log::default_max_backups")]
    pub max_backups: u32,
    #[serde(default)]
    pub compress_backups: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            path: "logs/rendergate.log".to_string(),
            max_size_mb: Self::default_max_size_mb(),
            max_backups: Self::default_max_backups(),
            compress_backups: false,
        }
    }
}

impl Log {
    fn validate_path(path: &str) -> std::result::Result<(), ValidationError> {
        if path.contains('\0') || path.trim().is_empty() {
            return Err(ValidationError::new("invalid_log_path"));
        }
        Ok(())
    }
    fn default_max_size_mb() -> u64 {
        100
    }
    fn default_max_backups() -> u32 {
        5
    }
}

/// Per-request structured access log (C16, §4.15) — distinct from the
/// ambient `Log` above: templated lines rather than free-text, and its own
/// rotation/backup settings since write volume tracks traffic, not errors.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct EventLogConfig {
    #[serde(default = "EventLogConfig::default_path")]
    pub path: String,
    #[serde(default = "EventLogConfig::default_template")]
    pub template: String,
    #[serde(default = "EventLogConfig::default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "EventLogConfig::default_max_backups")]
    pub max_backups: u32,
    #[serde(default)]
    pub compress_backups: bool,
    #[serde(default = "EventLogConfig::default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            template: Self::default_template(),
            max_size_mb: Self::default_max_size_mb(),
            max_backups: Self::default_max_backups(),
            compress_backups: false,
            channel_capacity: Self::default_channel_capacity(),
        }
    }
}

impl EventLogConfig {
    fn default_path() -> String {
        "logs/events.log".to_string()
    }
    fn default_template() -> String {
        "{timestamp} {request_id} {host_id} {dimension_id} {outcome} {status} {cache_key} {client_ip} {latency_ms}".to_string()
    }
    fn default_max_size_mb() -> u64 {
        100
    }
    fn default_max_backups() -> u32 {
        5
    }
    fn default_channel_capacity() -> usize {
        4096
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CleanupConfig {
    #[serde(default = "CleanupConfig::default_interval_ms")]
    #[validate(range(min = 100))]
    pub interval_ms: u64,
    #[serde(default = "CleanupConfig::default_safety_margin_secs")]
    pub safety_margin_secs: i64,
    #[serde(default = "CleanupConfig::default_base_path")]
    pub base_path: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            safety_margin_secs: Self::default_safety_margin_secs(),
            base_path: Self::default_base_path(),
        }
    }
}

impl CleanupConfig {
    fn default_interval_ms() -> u64 {
        60_000
    }
    fn default_safety_margin_secs() -> i64 {
        300
    }
    fn default_base_path() -> String {
        "cache-data".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "RecacheConfig::validate_normal_check_interval"))]
pub struct RecacheConfig {
    #[serde(default = "RecacheConfig::default_tick_interval_ms")]
    #[validate(range(min = 100))]
    pub tick_interval_ms: u64,
    #[serde(default = "RecacheConfig::default_normal_check_interval_ms")]
    pub normal_check_interval_ms: u64,
    #[serde(default = "RecacheConfig::default_rs_capacity_reserved")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub rs_capacity_reserved: f64,
    #[serde(default = "RecacheConfig::default_internal_queue_max_size")]
    pub internal_queue_max_size: usize,
    #[serde(default = "RecacheConfig::default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "RecacheConfig::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "RecacheConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RecacheConfig::default_timeout_per_url_ms")]
    pub timeout_per_url_ms: u64,
}

impl Default for RecacheConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: Self::default_tick_interval_ms(),
            normal_check_interval_ms: Self::default_normal_check_interval_ms(),
            rs_capacity_reserved: Self::default_rs_capacity_reserved(),
            internal_queue_max_size: Self::default_internal_queue_max_size(),
            worker_count: Self::default_worker_count(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            max_retries: Self::default_max_retries(),
            timeout_per_url_ms: Self::default_timeout_per_url_ms(),
        }
    }
}

impl RecacheConfig {
    /// §4.14: the normal-priority check only runs every `normal_check_interval_ms
    /// / tick_interval_ms` ticks, so the former must be an exact multiple of the
    /// latter — a non-multiple would silently change drain cadence instead of
    /// rejecting (§6 "normal_check_interval ≡ 0 (mod tick_interval)").
    fn validate_normal_check_interval(&self) -> std::result::Result<(), ValidationError> {
        if self.tick_interval_ms == 0
            || self.normal_check_interval_ms == 0
            || self.normal_check_interval_ms % self.tick_interval_ms != 0
        {
            return Err(ValidationError::new("normal_check_interval_not_a_multiple_of_tick"));
        }
        Ok(())
    }

    fn default_tick_interval_ms() -> u64 {
        1000
    }
    fn default_normal_check_interval_ms() -> u64 {
        10_000
    }
    fn default_rs_capacity_reserved() -> f64 {
        0.2
    }
    fn default_internal_queue_max_size() -> usize {
        1024
    }
    fn default_worker_count() -> usize {
        4
    }
    fn default_retry_base_delay_ms() -> u64 {
        500
    }
    fn default_max_retries() -> u32 {
        5
    }
    fn default_timeout_per_url_ms() -> u64 {
        10_000
    }
}

/// Global render/bypass/tracking/sharding defaults, overlaid by host then rule (§4.3).
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct Defaults {
    #[validate(nested)]
    pub render: RenderDefaults,
    #[validate(nested)]
    pub bypass: BypassDefaults,
    #[validate(nested)]
    pub tracking_params: TrackingParamsDefaults,
    #[validate(nested)]
    pub sharding: ShardingDefaults,
    #[serde(default = "Defaults::default_compression")]
    pub compression_algorithm: CompressionAlgorithm,
    #[serde(default)]
    pub safe_request_headers: Vec<String>,
    #[serde(default)]
    pub bothit_recache: BotHitRecacheDefaults,
}

impl Defaults {
    fn default_compression() -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RenderDefaults {
    #[serde(default = "RenderDefaults::default_ttl_secs")]
    pub cache_ttl_secs: i64,
    #[serde(default = "RenderDefaults::default_stale_ttl_secs")]
    pub cache_stale_ttl_secs: i64,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    #[serde(default = "RenderDefaults::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            cache_ttl_secs: Self::default_ttl_secs(),
            cache_stale_ttl_secs: Self::default_stale_ttl_secs(),
            cache_strategy: CacheStrategy::default(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl RenderDefaults {
    fn default_ttl_secs() -> i64 {
        3600
    }
    fn default_stale_ttl_secs() -> i64 {
        300
    }
    fn default_timeout_secs() -> u64 {
        15
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    #[default]
    LeastLoaded,
    MostAvailable,
    RoundRobin,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct BypassDefaults {
    #[serde(default = "BypassDefaults::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "BypassDefaults::default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
    #[serde(default = "BypassDefaults::default_cacheable_status_codes")]
    pub cacheable_status_codes: Vec<u16>,
}

impl Default for BypassDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            cache_enabled: false,
            cache_ttl_secs: Self::default_cache_ttl_secs(),
            cacheable_status_codes: Self::default_cacheable_status_codes(),
        }
    }
}

impl BypassDefaults {
    fn default_timeout_secs() -> u64 {
        5
    }
    fn default_cache_ttl_secs() -> i64 {
        60
    }
    fn default_cacheable_status_codes() -> Vec<u16> {
        vec![200]
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct TrackingParamsDefaults {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct ShardingDefaults {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ShardingDefaults::default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub strategy: ShardStrategy,
    #[serde(default)]
    pub push_on_render: bool,
    #[serde(default)]
    pub replicate_on_pull: bool,
}

impl Default for ShardingDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            replication_factor: Self::default_replication_factor(),
            strategy: ShardStrategy::default(),
            push_on_render: false,
            replicate_on_pull: false,
        }
    }
}

impl ShardingDefaults {
    fn default_replication_factor() -> usize {
        1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    #[default]
    Rendezvous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    None,
    Snappy,
    #[default]
    Lz4,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct BotHitRecacheDefaults {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "BotHitRecacheDefaults::default_interval_secs")]
    pub interval_secs: i64,
    #[serde(default)]
    pub bot_alias_patterns: Vec<String>,
}

impl BotHitRecacheDefaults {
    fn default_interval_secs() -> i64 {
        600
    }
}

/// One tenant. Id must be unique; `domain` + `aliases` resolve `AUTH`/`CANON` host matches.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Host::validate_nonempty_domain"))]
pub struct Host {
    pub id: u32,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub render_key: String,
    #[serde(default = "Host::default_enabled")]
    pub enabled: bool,
    #[validate(nested)]
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[validate(nested)]
    #[serde(default)]
    pub url_rules: Vec<UrlRule>,
    /// Dimension id used when no dimension's UA patterns match the request.
    pub fallback_dimension_id: Option<u32>,
    /// Host-level overlay onto global defaults; fields left `None` are "absent" (§4.3).
    #[serde(default)]
    pub overrides: HostOverrides,
}

impl Host {
    fn default_enabled() -> bool {
        true
    }
    fn validate_nonempty_domain(&self) -> std::result::Result<(), ValidationError> {
        if self.domain.trim().is_empty() {
            return Err(ValidationError::new("domain_required"));
        }
        Ok(())
    }

    pub fn find_dimension(&self, id: u32) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }
}

/// Host-level field overlay. Every field is `Option` so the resolver can tell
/// "absent" (inherit global) from "explicitly zero".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostOverrides {
    pub render_cache_ttl_secs: Option<i64>,
    pub render_cache_stale_ttl_secs: Option<i64>,
    pub render_timeout_secs: Option<u64>,
    pub bypass_timeout_secs: Option<u64>,
    pub bypass_cache_enabled: Option<bool>,
    pub sharding_enabled: Option<bool>,
    pub tracking_params_enabled: Option<bool>,
    pub tracking_params_patterns: Option<Vec<String>>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Dimension {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub user_agent_patterns: Vec<String>,
    pub rendering_user_agent: String,
}

/// Action taken for requests whose canonical path matches this rule (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuleAction {
    Render,
    Bypass,
    Block,
    Status { code: u16 },
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct UrlRule {
    #[serde(default)]
    pub patterns: Vec<String>,
    pub action: RuleAction,
    #[validate(nested)]
    pub render_overrides: Option<RenderRuleOverrides>,
    #[validate(nested)]
    pub bypass_overrides: Option<BypassRuleOverrides>,
    #[serde(default)]
    pub status_headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RenderRuleOverrides {
    pub timeout_secs: Option<u64>,
    pub dimension_id: Option<u32>,
    pub cache_ttl_secs: Option<i64>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct BypassRuleOverrides {
    pub cache_enabled: Option<bool>,
    #[serde(default)]
    pub cacheable_status_codes: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
gateway:
  eg_id: eg-1
  listen: "0.0.0.0:8080"
  internal:
    address: "0.0.0.0:9091"
  directory:
    url: "redis://127.0.0.1:6379"
  log:
    path: "logs/test.log"

hosts:
  - id: 1
    domain: example.com
    render_key: secret
    dimensions:
      - id: 1
        width: 1920
        height: 1080
        user_agent_patterns: ["*"]
        rendering_user_agent: "Mozilla/5.0 rendergate"
    fallback_dimension_id: 1
        "#
    }

    #[test]
    fn loads_minimal_config() {
        let conf = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(conf.hosts.len(), 1);
        assert_eq!(conf.hosts[0].domain, "example.com");
        assert!(conf.find_host("example.com").is_some());
        assert!(conf.find_host("other.com").is_none());
    }

    #[test]
    fn rejects_duplicate_host_ids() {
        let yaml = format!(
            "{}\n  - id: 1\n    domain: other.com\n    render_key: x\n",
            minimal_yaml()
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_status_port_colliding_with_listen_port() {
        let yaml = minimal_yaml().replacen(
            "internal:\n    address: \"0.0.0.0:9091\"",
            "internal:\n    address: \"0.0.0.0:9091\"\n  status:\n    address: \"0.0.0.0:8080\"",
            1,
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_zero_listen_port() {
        let yaml = minimal_yaml().replacen("0.0.0.0:8080", "0.0.0.0:0", 1);
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_normal_check_interval_not_a_multiple_of_tick() {
        let yaml = minimal_yaml().replacen(
            "log:\n    path: \"logs/test.log\"",
            "log:\n    path: \"logs/test.log\"\n  recache:\n    tick_interval_ms: 1000\n    normal_check_interval_ms: 2500",
            1,
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn accepts_normal_check_interval_that_is_a_multiple_of_tick() {
        let yaml = minimal_yaml().replacen(
            "log:\n    path: \"logs/test.log\"",
            "log:\n    path: \"logs/test.log\"\n  recache:\n    tick_interval_ms: 1000\n    normal_check_interval_ms: 3000",
            1,
        );
        assert!(Config::from_yaml(&yaml).is_ok());
    }
}
