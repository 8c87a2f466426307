//! Config resolver (C4): merges global defaults, host overlay, and the first
//! matching URL rule into a frozen, per-request `ResolvedConfig` (§4.3).
//!
//! Precompiled pattern sets live beside the raw config tree in a
//! `CompiledConfig` built once at load (and on every hot-reload), the way the
//! teacher precompiles `NODE_KEY_REGEX` rather than per-request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{CacheStrategy, CompressionAlgorithm, Config, Dimension, Host, RuleAction, ShardStrategy};
use crate::error::GatewayError;
use crate::pattern::PatternSet;

/// Immutable, per-request output of the resolver (§3 ResolvedConfig).
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub action: RuleAction,
    pub render_cache_ttl_secs: i64,
    pub render_cache_stale_ttl_secs: i64,
    pub render_cache_strategy: CacheStrategy,
    pub render_timeout_secs: u64,
    pub bypass_timeout_secs: u64,
    pub bypass_cache_enabled: bool,
    pub bypass_cache_ttl_secs: i64,
    pub bypass_cacheable_status_codes: Vec<u16>,
    pub sharding_enabled: bool,
    pub sharding_replication_factor: usize,
    pub sharding_strategy: ShardStrategy,
    pub sharding_push_on_render: bool,
    pub sharding_replicate_on_pull: bool,
    pub tracking_params_enabled: bool,
    pub compression_algorithm: CompressionAlgorithm,
    pub safe_request_headers: Vec<String>,
    pub status_code: Option<u16>,
    pub status_headers: HashMap<String, String>,
    /// Dimension id carried by a rule override, if any — matching one counts
    /// as a successful dimension match per §4.3.
    pub dimension_override: Option<u32>,
    pub render_blocked_patterns: Vec<String>,
}

/// A host with its dimension and URL-rule patterns precompiled.
pub struct CompiledHost {
    pub host: Host,
    dimension_patterns: Vec<PatternSet>,
    rule_patterns: Vec<PatternSet>,
}

impl CompiledHost {
    pub fn compile(host: Host) -> Self {
        let dimension_patterns = host
            .dimensions
            .iter()
            .map(|d| PatternSet::compile(&d.user_agent_patterns))
            .collect();
        let rule_patterns = host
            .url_rules
            .iter()
            .map(|r| PatternSet::compile(&r.patterns))
            .collect();
        Self {
            host,
            dimension_patterns,
            rule_patterns,
        }
    }

    /// First dimension whose UA patterns match `user_agent`.
    pub fn match_dimension(&self, user_agent: &str) -> Option<&Dimension> {
        self.host
            .dimensions
            .iter()
            .zip(self.dimension_patterns.iter())
            .find(|(_, patterns)| patterns.is_match(user_agent))
            .map(|(d, _)| d)
    }

    /// First URL rule whose patterns match `path_and_query` (canonical URL
    /// minus scheme+host, per §4.3).
    fn match_rule_index(&self, path_and_query: &str) -> Option<usize> {
        self.rule_patterns
            .iter()
            .position(|patterns| patterns.is_match(path_and_query))
    }
}

/// Global defaults plus compiled hosts, swappable as one unit behind an
/// `arc_swap::ArcSwap` at the call site (A.3) for copy-on-write reload.
pub struct CompiledConfig {
    pub raw: Arc<Config>,
    pub hosts_by_id: HashMap<u32, CompiledHost>,
    global_strip_patterns: PatternSet,
    pub bot_alias_patterns: PatternSet,
}

impl CompiledConfig {
    pub fn build(raw: Arc<Config>) -> Self {
        let global_strip_patterns = PatternSet::compile(&raw.defaults.tracking_params.patterns);
        let bot_alias_patterns = PatternSet::compile(&raw.defaults.bothit_recache.bot_alias_patterns);
        let hosts_by_id = raw
            .hosts
            .iter()
            .cloned()
            .map(|h| (h.id, CompiledHost::compile(h)))
            .collect();
        Self {
            raw,
            hosts_by_id,
            global_strip_patterns,
            bot_alias_patterns,
        }
    }

    pub fn find_host_by_domain(&self, domain: &str) -> Option<&CompiledHost> {
        let domain = domain.to_ascii_lowercase();
        self.hosts_by_id.values().find(|ch| {
            ch.host.enabled
                && (ch.host.domain == domain || ch.host.aliases.iter().any(|a| a == &domain))
        })
    }

    /// §4.3: global → host → first-matching-rule, field-wise overlay.
    pub fn resolve(
        &self,
        host: &CompiledHost,
        path_and_query: &str,
    ) -> Result<ResolvedConfig, GatewayError> {
        let d = &self.raw.defaults;
        let o = &host.host.overrides;

        let mut resolved = ResolvedConfig {
            action: RuleAction::Render,
            render_cache_ttl_secs: o.render_cache_ttl_secs.unwrap_or(d.render.cache_ttl_secs),
            render_cache_stale_ttl_secs: o
                .render_cache_stale_ttl_secs
                .unwrap_or(d.render.cache_stale_ttl_secs),
            render_cache_strategy: d.render.cache_strategy,
            render_timeout_secs: o.render_timeout_secs.unwrap_or(d.render.timeout_secs),
            bypass_timeout_secs: o.bypass_timeout_secs.unwrap_or(d.bypass.timeout_secs),
            bypass_cache_enabled: o.bypass_cache_enabled.unwrap_or(d.bypass.cache_enabled),
            bypass_cache_ttl_secs: d.bypass.cache_ttl_secs,
            bypass_cacheable_status_codes: d.bypass.cacheable_status_codes.clone(),
            sharding_enabled: o.sharding_enabled.unwrap_or(d.sharding.enabled),
            sharding_replication_factor: d.sharding.replication_factor,
            sharding_strategy: d.sharding.strategy,
            sharding_push_on_render: d.sharding.push_on_render,
            sharding_replicate_on_pull: d.sharding.replicate_on_pull,
            tracking_params_enabled: o
                .tracking_params_enabled
                .unwrap_or(d.tracking_params.enabled),
            compression_algorithm: o
                .compression_algorithm
                .unwrap_or(d.compression_algorithm),
            safe_request_headers: d.safe_request_headers.clone(),
            status_code: None,
            status_headers: HashMap::new(),
            dimension_override: None,
            render_blocked_patterns: Vec::new(),
        };

        if let Some(idx) = host.match_rule_index(path_and_query) {
            let rule = &host.host.url_rules[idx];
            resolved.action = rule.action.clone();

            if let Some(ro) = &rule.render_overrides {
                if let Some(t) = ro.timeout_secs {
                    resolved.render_timeout_secs = t;
                }
                if let Some(dim) = ro.dimension_id {
                    resolved.dimension_override = Some(dim);
                }
                if let Some(ttl) = ro.cache_ttl_secs {
                    resolved.render_cache_ttl_secs = ttl;
                }
                if let Some(alg) = ro.compression_algorithm {
                    resolved.compression_algorithm = alg;
                }
                if !ro.blocked_patterns.is_empty() {
                    resolved.render_blocked_patterns = ro.blocked_patterns.clone();
                }
            }

            if let Some(bo) = &rule.bypass_overrides {
                if let Some(enabled) = bo.cache_enabled {
                    resolved.bypass_cache_enabled = enabled;
                }
                if !bo.cacheable_status_codes.is_empty() {
                    resolved.bypass_cacheable_status_codes = bo.cacheable_status_codes.clone();
                }
            }

            if let RuleAction::Status { code } = rule.action {
                resolved.status_code = Some(code);
                resolved.status_headers = rule.status_headers.clone();
            }
        }

        if resolved.render_cache_ttl_secs + resolved.render_cache_stale_ttl_secs <= 0 {
            return Err(GatewayError::ConfigurationError(
                "resolved render cache ttl + stale_ttl must be > 0".to_string(),
            ));
        }

        Ok(resolved)
    }

    /// Compiled tracking-param strip patterns for a host (host overlay wins
    /// over global when explicitly present).
    pub fn strip_patterns_for(&self, host: &CompiledHost) -> PatternSet {
        match &host.host.overrides.tracking_params_patterns {
            Some(patterns) => PatternSet::compile(patterns),
            None => PatternSet::compile(&self.global_strip_patterns.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dimension, UrlRule};

    fn sample_host() -> Host {
        Host {
            id: 1,
            domain: "example.com".to_string(),
            aliases: vec![],
            render_key: "secret".to_string(),
            enabled: true,
            dimensions: vec![Dimension {
                id: 1,
                width: 1920,
                height: 1080,
                user_agent_patterns: vec!["*bot*".to_string()],
                rendering_user_agent: "rendergate-bot".to_string(),
            }],
            url_rules: vec![UrlRule {
                patterns: vec!["/admin/*".to_string()],
                action: RuleAction::Block,
                render_overrides: None,
                bypass_overrides: None,
                status_headers: HashMap::new(),
            }],
            fallback_dimension_id: Some(1),
            overrides: Default::default(),
        }
    }

    #[test]
    fn resolves_global_defaults_when_no_rule_matches() {
        let config = Config {
            hosts: vec![sample_host()],
            ..Default::default()
        };
        let compiled = CompiledConfig::build(Arc::new(config));
        let host = compiled.hosts_by_id.get(&1).unwrap();
        let resolved = compiled.resolve(host, "/blog/post-1").unwrap();
        assert_eq!(resolved.action, RuleAction::Render);
    }

    #[test]
    fn first_matching_rule_overrides_action() {
        let config = Config {
            hosts: vec![sample_host()],
            ..Default::default()
        };
        let compiled = CompiledConfig::build(Arc::new(config));
        let host = compiled.hosts_by_id.get(&1).unwrap();
        let resolved = compiled.resolve(host, "/admin/panel").unwrap();
        assert_eq!(resolved.action, RuleAction::Block);
    }

    #[test]
    fn dimension_matching_is_case_insensitive_wildcard() {
        let config = Config {
            hosts: vec![sample_host()],
            ..Default::default()
        };
        let compiled = CompiledConfig::build(Arc::new(config));
        let host = compiled.hosts_by_id.get(&1).unwrap();
        assert!(host.match_dimension("Mozilla/5.0 Googlebot/2.1").is_some());
        assert!(host.match_dimension("Mozilla/5.0 Chrome").is_none());
    }
}
