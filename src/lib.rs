//! `rendergate`: a multi-tenant HTML rendering cache fronted by an edge
//! gateway tier, built the way the teacher builds its API gateway — a
//! pingora `ProxyHttp` service for the request path, small `ServeHttp` apps
//! for auxiliary HTTP surfaces, and a handful of background tasks composed
//! in `main.rs`.

pub mod admin;
pub mod bypass;
pub mod cache;
pub mod canon;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod internal;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pattern;
pub mod recache;
pub mod render_client;
pub mod rs_select;
pub mod shard;
pub mod tabs;
pub(crate) mod utils;
