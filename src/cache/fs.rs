//! Filesystem cache (C6): atomic write + read of compressed HTML blobs under
//! a content base directory (§4.5). Atomic rename is the only synchronization
//! primitive here, per §5 — the same "write temp, fsync, rename" idiom the
//! teacher relies on for its config-reload snapshot swap, applied to file I/O.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::CompressionAlgorithm;
use crate::error::{GatewayError, GatewayResult};

/// Minimum body size below which compression is skipped even if configured (§4.5).
const MIN_COMPRESS_BYTES: usize = 1024;

pub struct FsCache {
    base: PathBuf,
}

impl FsCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `{base}/{host_id}/{YYYY}/{MM}/{DD}/{HH}/{mm}/{url_hash}_{dim_id}.html[.ext]`.
    /// `expires_at` is the minute directory per §4.5 — it IS the expiration time, UTC.
    pub fn relative_path(
        host_id: u32,
        dimension_id: u32,
        url_hash: &str,
        expires_at_unix: i64,
        algorithm: CompressionAlgorithm,
    ) -> String {
        let t: DateTime<Utc> = DateTime::from_timestamp(expires_at_unix, 0).unwrap_or_else(Utc::now);
        let ext = match algorithm {
            CompressionAlgorithm::None => "",
            CompressionAlgorithm::Snappy => ".snappy",
            CompressionAlgorithm::Lz4 => ".lz4",
        };
        format!(
            "{}/{:04}/{:02}/{:02}/{:02}/{:02}/{}_{}.html{}",
            host_id,
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            url_hash,
            dimension_id,
            ext
        )
    }

    /// Resolve a relative path to an absolute one under `base`, rejecting any
    /// path that would escape it (§8 invariant 3). No `..` component, and no
    /// absolute-path component, survives the join.
    pub fn absolute_path(&self, relative: &str) -> GatewayResult<PathBuf> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(GatewayError::InternalError(format!(
                "cache path escapes base directory: {relative}"
            )));
        }
        let joined = self.base.join(rel);
        let canon_base = self.base.clone();
        if !joined.starts_with(&canon_base) {
            return Err(GatewayError::InternalError(format!(
                "cache path escapes base directory: {relative}"
            )));
        }
        Ok(joined)
    }

    /// Compress (if the algorithm and size call for it) and write atomically:
    /// write to `path.tmp`, fsync, rename into place.
    pub async fn write(
        &self,
        relative: &str,
        body: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> GatewayResult<usize> {
        let path = self.absolute_path(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let on_disk = encode(body, algorithm);

        let tmp_path = path.with_extension(format!(
            "{}tmp",
            path.extension().map(|e| format!("{}.", e.to_string_lossy())).unwrap_or_default()
        ));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&on_disk).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        Ok(on_disk.len())
    }

    /// Read and decompress by file extension. An unrecognized extension is
    /// served raw (§4.5). Decompression failure surfaces as a distinct error
    /// so the orchestrator treats the entry as a miss and re-renders.
    pub async fn read(&self, relative: &str) -> GatewayResult<Vec<u8>> {
        let path = self.absolute_path(relative)?;
        let raw = fs::read(&path).await?;
        decode(&raw, relative)
    }

    pub async fn exists(&self, relative: &str) -> GatewayResult<bool> {
        let path = self.absolute_path(relative)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    pub async fn remove_dir_all(&self, relative_dir: &str) -> GatewayResult<()> {
        let path = self.absolute_path(relative_dir)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

fn encode(body: &[u8], algorithm: CompressionAlgorithm) -> Vec<u8> {
    if body.len() < MIN_COMPRESS_BYTES {
        return body.to_vec();
    }
    match algorithm {
        CompressionAlgorithm::None => body.to_vec(),
        CompressionAlgorithm::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            encoder.compress_vec(body).unwrap_or_else(|_| body.to_vec())
        }
        CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(body),
    }
}

fn decode(raw: &[u8], relative_path: &str) -> GatewayResult<Vec<u8>> {
    if relative_path.ends_with(".snappy") {
        let mut decoder = snap::raw::Decoder::new();
        return decoder
            .decompress_vec(raw)
            .map_err(|_| GatewayError::DecompressionError);
    }
    if relative_path.ends_with(".lz4") {
        return lz4_flex::decompress_size_prepended(raw).map_err(|_| GatewayError::DecompressionError);
    }
    Ok(raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_uses_expiration_minute_as_directory() {
        let rel = FsCache::relative_path(1, 2, "abc123", 1_700_000_000, CompressionAlgorithm::Lz4);
        assert!(rel.starts_with("1/"));
        assert!(rel.ends_with("abc123_2.html.lz4"));
    }

    #[test]
    fn absolute_path_rejects_traversal() {
        let cache = FsCache::new("/tmp/rendergate-test-base");
        assert!(cache.absolute_path("../../etc/passwd").is_err());
        assert!(cache.absolute_path("1/2024/01/01/00/00/abc_1.html").is_ok());
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_below_compression_threshold() {
        let dir = std::env::temp_dir().join(format!("rendergate-fs-{}", uuid::Uuid::new_v4()));
        let cache = FsCache::new(&dir);
        let rel = "1/2024/01/01/00/00/smallhash_1.html";
        cache.write(rel, b"tiny body", CompressionAlgorithm::Lz4).await.unwrap();
        let read = cache.read(rel).await.unwrap();
        assert_eq!(read, b"tiny body");
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_with_lz4_compression() {
        let dir = std::env::temp_dir().join(format!("rendergate-fs-{}", uuid::Uuid::new_v4()));
        let cache = FsCache::new(&dir);
        let body = "x".repeat(4096);
        let rel = "1/2024/01/01/00/00/bighash_1.html.lz4";
        cache.write(rel, body.as_bytes(), CompressionAlgorithm::Lz4).await.unwrap();
        let read = cache.read(rel).await.unwrap();
        assert_eq!(read, body.as_bytes());
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn unknown_extension_is_served_raw() {
        let dir = std::env::temp_dir().join(format!("rendergate-fs-{}", uuid::Uuid::new_v4()));
        let cache = FsCache::new(&dir);
        let rel = "1/2024/01/01/00/00/rawhash_1.html.weird";
        tokio::fs::create_dir_all(dir.join("1/2024/01/01/00/00")).await.unwrap();
        tokio::fs::write(cache.absolute_path(rel).unwrap(), b"raw bytes").await.unwrap();
        let read = cache.read(rel).await.unwrap();
        assert_eq!(read, b"raw bytes");
        let _ = fs::remove_dir_all(&dir).await;
    }
}
