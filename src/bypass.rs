//! Bypass fetcher (C13): direct origin fetch with an SSRF guard, used when
//! rendering is disabled, a URL rule forces bypass, or rendering fails
//! (§4.12). HTTP client is `reqwest`, grounded the way the retrieval pack's
//! gateway-shaped repos (`choronz-gateway`, `06chaynes-http-cache`) use it
//! for outbound, non-proxied fetches. `ipnetwork` — already a teacher
//! dependency — supplies the private-range membership checks.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use tokio::net::lookup_host;

use crate::error::{GatewayError, GatewayResult};

static PRIVATE_V4_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "100.64.0.0/10", // CG-NAT
        "0.0.0.0/8",
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
});

static PRIVATE_V6_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "::1/128",    // loopback
        "fc00::/7",   // unique-local
        "fe80::/10",  // link-local
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
});

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    PRIVATE_V4_RANGES.iter().any(|net| net.contains(IpAddr::V4(ip)))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    PRIVATE_V6_RANGES.iter().any(|net| net.contains(IpAddr::V6(ip)))
}

pub struct BypassResult {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
}

pub struct BypassFetcher {
    client: reqwest::Client,
    allow_private_targets: bool,
}

impl BypassFetcher {
    pub fn new(allow_private_targets: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .expect("reqwest client builder should not fail with defaults"),
            allow_private_targets,
        }
    }

    /// Fetch `url`, forwarding only `safe_request_headers` and forcing the
    /// configured bypass User-Agent (§4.12). Rejects SSRF targets unless
    /// explicitly opted out.
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        safe_request_headers: &[(String, String)],
        user_agent: &str,
    ) -> GatewayResult<BypassResult> {
        let parsed = url::Url::parse(url)
            .map_err(|e| GatewayError::InvalidRequest(format!("bypass: bad url: {e}")))?;

        if !self.allow_private_targets {
            self.guard_ssrf(&parsed).await?;
        }

        let mut builder = self.client.get(url).timeout(timeout).header("User-Agent", user_agent);
        for (name, value) in safe_request_headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("bypass fetch failed: {e}")))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("bypass body read failed: {e}")))?
            .to_vec();

        Ok(BypassResult {
            status,
            body,
            content_type,
            headers,
        })
    }

    async fn guard_ssrf(&self, url: &url::Url) -> GatewayResult<()> {
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::InvalidRequest("bypass: url has no host".to_string()))?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                return Err(GatewayError::InvalidRequest(format!(
                    "bypass target '{host}' resolves to a private address"
                )));
            }
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let resolved = lookup_host((host, port))
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("bypass dns lookup failed: {e}")))?;

        let mut any_resolved = false;
        for addr in resolved {
            any_resolved = true;
            if is_private_ip(addr.ip()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "bypass target '{host}' resolves to a private address ({})",
                    addr.ip()
                )));
            }
        }
        if !any_resolved {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "bypass target '{host}' did not resolve"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rfc1918_loopback_and_link_local_as_private() {
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("172.16.0.5".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("169.254.1.1".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn classifies_ipv6_ranges() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("2606:4700:4700::1111".parse().unwrap()));
    }
}
