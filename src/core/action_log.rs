//! 操作日志（追加写入的 JSON Lines）
//!
//! 记录本地化、上传、删除和清理操作；`get_prune_log` 读取的就是这个文件。

use crate::core::resolver::AssetKey;
use anyhow::Result;
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// 读取日志时最多返回的行数
pub const LOG_MAX_LINES: usize = 200;

/// 清理原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    /// 任务完成后自动清理
    Auto,
    /// 手动清理
    Manual,
    DeleteFailed,
}

/// 单条清理记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneLogEntry {
    /// 毫秒时间戳
    pub timestamp: i64,
    pub key: AssetKey,
    pub bytes_freed: u64,
    pub reason: PruneReason,
}

/// 日志条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionEntry {
    Localize {
        timestamp: i64,
        key: AssetKey,
        bytes: u64,
        overwrite: bool,
    },
    Upload {
        timestamp: i64,
        key: AssetKey,
        bytes: u64,
        overwrite: bool,
    },
    DeleteLocal {
        timestamp: i64,
        key: AssetKey,
    },
    Prune(PruneLogEntry),
}

impl ActionEntry {
    fn render(&self) -> String {
        match self {
            ActionEntry::Localize {
                timestamp,
                key,
                bytes,
                overwrite,
            } => format!(
                "[{}] Localize: {} ({}, overwrite: {})",
                format_timestamp(*timestamp),
                key,
                format_size(*bytes),
                if *overwrite { "yes" } else { "no" }
            ),
            ActionEntry::Upload {
                timestamp,
                key,
                bytes,
                overwrite,
            } => format!(
                "[{}] Upload: {} ({}, overwrite: {})",
                format_timestamp(*timestamp),
                key,
                format_size(*bytes),
                if *overwrite { "yes" } else { "no" }
            ),
            ActionEntry::DeleteLocal { timestamp, key } => {
                format!("[{}] Delete local: {}", format_timestamp(*timestamp), key)
            }
            ActionEntry::Prune(entry) => match entry.reason {
                PruneReason::DeleteFailed => format!(
                    "[{}] Prune failed: {} (delete_failed)",
                    format_timestamp(entry.timestamp),
                    entry.key
                ),
                reason => format!(
                    "[{}] Prune ({}): {} freed {}",
                    format_timestamp(entry.timestamp),
                    if reason == PruneReason::Auto { "auto" } else { "manual" },
                    entry.key,
                    format_size(entry.bytes_freed)
                ),
            },
        }
    }
}

/// 人类可读的大小
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

fn format_timestamp(millis: i64) -> String {
    chrono::Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown time".to_string())
}

/// 操作日志
#[derive(Debug, Clone)]
pub struct ActionLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ActionLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("modelsync_actions.log"),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一批条目
    pub async fn append_all(&self, entries: &[ActionEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn append(&self, entry: ActionEntry) -> Result<()> {
        self.append_all(std::slice::from_ref(&entry)).await
    }

    /// 读取最近的条目；无法解析的行被跳过
    pub async fn entries(&self) -> Result<Vec<ActionEntry>> {
        Ok(self
            .tail_lines()
            .await?
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// 渲染为可读文本（最近 [`LOG_MAX_LINES`] 行）
    pub async fn read_text(&self) -> Result<String> {
        let lines = self.tail_lines().await?;
        let rendered: Vec<String> = lines
            .iter()
            .map(|line| match serde_json::from_str::<ActionEntry>(line) {
                Ok(entry) => entry.render(),
                Err(_) => line.clone(),
            })
            .collect();
        Ok(rendered.join("\n"))
    }

    async fn tail_lines(&self) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(LOG_MAX_LINES);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KiB");
        assert_eq!(format_size(1536 * 1024 * 1024), "1.50 GiB");
    }

    #[tokio::test]
    async fn test_append_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::new(dir.path());
        let key = AssetKey::new("checkpoints", "foo.safetensors").unwrap();

        log.append(ActionEntry::Localize {
            timestamp: 0,
            key: key.clone(),
            bytes: 2048,
            overwrite: false,
        })
        .await
        .unwrap();
        log.append(ActionEntry::Prune(PruneLogEntry {
            timestamp: 0,
            key: key.clone(),
            bytes_freed: 2048,
            reason: PruneReason::Manual,
        }))
        .await
        .unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], ActionEntry::Prune(ref p) if p.bytes_freed == 2048));

        let text = log.read_text().await.unwrap();
        assert!(text.contains("Localize: checkpoints/foo.safetensors (2.00 KiB, overwrite: no)"));
        assert!(text.contains("Prune (manual): checkpoints/foo.safetensors freed 2.00 KiB"));
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::new(dir.path());
        assert_eq!(log.read_text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActionLog::new(dir.path());
        let key = AssetKey::new("c", "a.pt").unwrap();
        let entries: Vec<ActionEntry> = (0..LOG_MAX_LINES + 5)
            .map(|i| ActionEntry::DeleteLocal {
                timestamp: i as i64,
                key: key.clone(),
            })
            .collect();
        log.append_all(&entries).await.unwrap();

        let read = log.entries().await.unwrap();
        assert_eq!(read.len(), LOG_MAX_LINES);
        assert_eq!(read[0], entries[5]);
    }
}
