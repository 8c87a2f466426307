//! Cache layer: metadata store (C5), filesystem blob store (C6), and the
//! cross-EG coordinator (C9) that ties them to sharding (C7/C8).

pub mod coordinator;
pub mod fs;
pub mod meta;

use serde::{Deserialize, Serialize};

/// (host_id, dimension_id, url_hash) — the stable identifier of a cached
/// artifact (§3). String form `cache:{host}:{dim}:{hash}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub host_id: u32,
    pub dimension_id: u32,
}

impl CacheKey {
    pub fn directory_key(&self, url_hash: &str) -> String {
        format!("cache:{}:{}:{}", self.host_id, self.dimension_id, url_hash)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Render,
    Bypass,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Render => "render",
            SourceTag::Bypass => "bypass",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "render" => Some(SourceTag::Render),
            "bypass" => Some(SourceTag::Bypass),
            _ => None,
        }
    }
}
