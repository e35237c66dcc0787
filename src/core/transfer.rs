//! 单文件传输：临时文件 + 原子重命名
//!
//! 传输过程中目标文件名下只可能出现三种状态：不存在、旧的完整文件、新的完整文件。

use crate::core::error::{SyncError, SyncResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认分块大小 16MB
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// 复制引擎
#[derive(Debug, Clone)]
pub struct CopyEngine {
    chunk_size: usize,
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl CopyEngine {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 与目标文件同目录的临时文件：`<destination>.partial.<tag>`
    pub fn partial_path(destination: &Path, tag: &str) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".partial.{}", tag));
        destination.with_file_name(name)
    }

    /// 复制 source -> destination
    ///
    /// * 目标存在且 `overwrite == false` 时直接返回 [`SyncError::AlreadyExists`]，不触碰文件系统
    /// * 每写完一块调用一次 `on_progress(已复制字节数)`，并在块之间检查 `cancel`
    /// * 取消或出错时删除临时文件，目标保持原样
    pub async fn copy<F>(
        &self,
        source: &Path,
        destination: &Path,
        overwrite: bool,
        tag: &str,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> SyncResult<u64>
    where
        F: FnMut(u64),
    {
        if !overwrite {
            match fs::try_exists(destination).await {
                Ok(true) => return Err(SyncError::AlreadyExists(destination.to_path_buf())),
                Ok(false) => {}
                Err(e) => return Err(SyncError::copy_failed(destination, e)),
            }
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut src = fs::File::open(source)
            .await
            .map_err(|e| SyncError::copy_failed(source, e))?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::copy_failed(destination, e))?;
        }

        let temp_path = Self::partial_path(destination, tag);
        // 任何非成功退出（包括 future 被丢弃）都会删除临时文件
        let guard = scopeguard::guard(temp_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除临时文件失败 {:?}: {}", path, e);
                }
            }
        });

        let mut dst = fs::File::create(&temp_path)
            .await
            .map_err(|e| SyncError::copy_failed(&temp_path, e))?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                debug!("传输已取消: {:?}", destination);
                return Err(SyncError::Cancelled);
            }

            let n = src
                .read(&mut buffer)
                .await
                .map_err(|e| SyncError::copy_failed(source, e))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buffer[..n])
                .await
                .map_err(|e| SyncError::copy_failed(&temp_path, e))?;
            copied += n as u64;
            on_progress(copied);
        }

        dst.flush()
            .await
            .map_err(|e| SyncError::copy_failed(&temp_path, e))?;
        dst.sync_all()
            .await
            .map_err(|e| SyncError::copy_failed(&temp_path, e))?;
        drop(dst);

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        fs::rename(&temp_path, destination)
            .await
            .map_err(|e| SyncError::copy_failed(destination, e))?;
        // 重命名成功后临时文件已不存在，解除清理
        scopeguard::ScopeGuard::into_inner(guard);

        debug!("传输完成: {:?} -> {:?} ({} 字节)", source, destination, copied);
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.contains(".partial."))
            .collect()
    }

    #[test]
    fn test_partial_path_keeps_full_name() {
        let p = CopyEngine::partial_path(Path::new("/a/model.v2.safetensors"), "job1");
        assert_eq!(p, PathBuf::from("/a/model.v2.safetensors.partial.job1"));
    }

    #[tokio::test]
    async fn test_copy_creates_parent_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("nested/dir/dst.bin");
        std::fs::write(&src, vec![7u8; 10_000]).unwrap();

        let engine = CopyEngine::with_chunk_size(4096);
        let mut seen = Vec::new();
        let copied = engine
            .copy(&src, &dst, false, "t", |n| seen.push(n), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(copied, 10_000);
        assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 10_000]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&10_000));
        assert!(partial_files(dst.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_existing_destination_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let err = CopyEngine::default()
            .copy(&src, &dst, false, "t", |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, vec![1u8; 150]).unwrap();
        std::fs::write(&dst, vec![0u8; 100]).unwrap();

        let copied = CopyEngine::default()
            .copy(&src, &dst, true, "t", |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(copied, 150);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 150);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, vec![9u8; 64 * 1024]).unwrap();
        std::fs::write(&dst, b"previous complete copy").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let err = CopyEngine::with_chunk_size(4096)
            .copy(
                &src,
                &dst,
                true,
                "t",
                |n| {
                    // 目标名下始终是旧文件
                    assert_eq!(std::fs::read(&dst).unwrap(), b"previous complete copy");
                    if n >= 8192 {
                        trigger.cancel();
                    }
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(std::fs::read(&dst).unwrap(), b"previous complete copy");
        assert!(partial_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_copy_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = CopyEngine::default()
            .copy(
                &dir.path().join("absent.bin"),
                &dir.path().join("dst.bin"),
                false,
                "t",
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CopyFailed { .. }));
        assert!(!dir.path().join("dst.bin").exists());
        assert!(partial_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_destination_is_copy_failed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain_file"), b"x").unwrap();
        // 父路径是普通文件，无法判断目标是否存在
        let dst = dir.path().join("plain_file/x.bin");

        let err = CopyEngine::default()
            .copy(
                &dir.path().join("absent.bin"),
                &dst,
                false,
                "t",
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            SyncError::CopyFailed { path, .. } => assert_eq!(path, dst),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(std::fs::read(dir.path().join("plain_file")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_rename_failure_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, vec![3u8; 100]).unwrap();
        // 非空目录不能被文件替换
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("keep.txt"), b"keep").unwrap();

        let err = CopyEngine::with_chunk_size(16)
            .copy(&src, &dst, true, "t", |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SyncError::CopyFailed { path, .. } => assert_eq!(path, dst),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(partial_files(dir.path()).is_empty());
        assert_eq!(std::fs::read(dst.join("keep.txt")).unwrap(), b"keep");
    }
}
