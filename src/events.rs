//! Event emitter (C16): templated access-log lines appended to a rotating
//! file, fed through a bounded ring channel so a slow disk never blocks the
//! request path (§4.15). Built the same way the teacher's `logging::Logger`
//! decouples callers from file I/O (`AsyncWriter` → `mpsc` → background
//! writer task) — the differences are a bounded channel with drop-newest
//! semantics (the teacher's logger channel is unbounded) and rotation.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{channel, Receiver, Sender};

/// One structured request-log record; rendered into the configured template
/// by substituting `{field}` placeholders.
pub type EventFields = HashMap<String, String>;

pub struct EventEmitterConfig {
    pub path: PathBuf,
    pub template: String,
    pub max_size_mb: u64,
    pub max_backups: u32,
    pub compress_backups: bool,
    pub channel_capacity: usize,
}

pub struct EventEmitter {
    sender: Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn spawn(config: EventEmitterConfig) -> Self {
        let (sender, receiver) = channel(config.channel_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(writer_task(config, receiver));
        Self { sender, dropped }
    }

    /// Render `fields` through the template and enqueue. On a full ring,
    /// drop the newest line and bump the drop counter rather than block.
    pub fn emit(&self, template: &str, fields: &EventFields) {
        let line = render_template(template, fields);
        match self.sender.try_send(line) {
            Ok(()) => {}
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!(dropped_total = dropped; "event emitter ring full, dropping newest line");
                }
            }
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn render_template(template: &str, fields: &EventFields) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let key = &template[i + 1..i + end];
                if let Some(value) = fields.get(key) {
                    out.push_str(value);
                } else {
                    out.push_str("-");
                }
                i += end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out.push('\n');
    out
}

async fn writer_task(config: EventEmitterConfig, mut receiver: Receiver<String>) {
    if let Some(parent) = config.path.parent() {
        if fs::metadata(parent).await.is_err() {
            if let Err(e) = fs::create_dir_all(parent).await {
                log::error!(error:? = e; "failed to create event log directory");
                return;
            }
        }
    }

    let mut file = match open_append(&config.path).await {
        Ok(f) => BufWriter::new(f),
        Err(e) => {
            log::error!(error:? = e; "failed to open event log file");
            return;
        }
    };
    let mut size_bytes = fs::metadata(&config.path).await.map(|m| m.len()).unwrap_or(0);
    let max_bytes = config.max_size_mb.saturating_mul(1024 * 1024);

    while let Some(line) = receiver.recv().await {
        if max_bytes > 0 && size_bytes + line.len() as u64 > max_bytes {
            if let Err(e) = file.flush().await {
                log::error!(error:? = e; "failed to flush event log before rotation");
            }
            drop(std::mem::replace(&mut file, BufWriter::new(match open_append(&config.path).await {
                Ok(f) => f,
                Err(e) => {
                    log::error!(error:? = e; "failed to reopen event log after rotation");
                    return;
                }
            })));
            rotate(&config).await;
            file = match open_append(&config.path).await {
                Ok(f) => BufWriter::new(f),
                Err(e) => {
                    log::error!(error:? = e; "failed to reopen event log after rotation");
                    return;
                }
            };
            size_bytes = 0;
        }

        if let Err(e) = file.write_all(line.as_bytes()).await {
            log::error!(error:? = e; "failed to write event log line");
            continue;
        }
        size_bytes += line.len() as u64;
    }

    let _ = file.flush().await;
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Shift `path.N` → `path.N+1` up to `max_backups`, then move `path` to
/// `path.1`, optionally gzip-compressing backups as they're created.
async fn rotate(config: &EventEmitterConfig) {
    let path = config.path.clone();
    let max_backups = config.max_backups;
    let compress = config.compress_backups;

    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if max_backups == 0 {
            std::fs::remove_file(&path).ok();
            return Ok(());
        }

        let ext = if compress { "gz" } else { "" };
        let backup_name = |n: u32| -> PathBuf {
            if ext.is_empty() {
                path.with_extension(format!(
                    "{}.{n}",
                    path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default()
                ))
            } else {
                path.with_extension(format!(
                    "{}.{n}.{ext}",
                    path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default()
                ))
            }
        };

        let oldest = backup_name(max_backups);
        if oldest.exists() {
            std::fs::remove_file(&oldest).ok();
        }
        for n in (1..max_backups).rev() {
            let from = backup_name(n);
            let to = backup_name(n + 1);
            if from.exists() {
                std::fs::rename(&from, &to).ok();
            }
        }

        if compress {
            let data = std::fs::read(&path)?;
            let dest = backup_name(1);
            let file = std::fs::File::create(&dest)?;
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()?;
            std::fs::remove_file(&path).ok();
        } else {
            let dest = backup_name(1);
            std::fs::rename(&path, &dest).ok();
        }
        Ok(())
    })
    .await;

    if let Err(e) = result {
        log::error!(error:? = e; "event log rotation task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders_and_blanks_unknown() {
        let mut fields = EventFields::new();
        fields.insert("request_id".to_string(), "req-1".to_string());
        fields.insert("status".to_string(), "200".to_string());
        let line = render_template("{request_id} {status} {missing}", &fields);
        assert_eq!(line, "req-1 200 -\n");
    }
}
