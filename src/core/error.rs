//! 同步引擎错误类型

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};

/// 同步引擎错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// 路径非法（绝对路径、`..` 穿越等）
    #[error("非法路径: {0}")]
    InvalidPath(String),

    #[error("未知分类: {0}")]
    UnknownCategory(String),

    /// 目标已存在且未允许覆盖
    #[error("目标文件已存在: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// 已有任务在运行
    #[error("已有任务正在运行: {0}")]
    Busy(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("任务已结束: {0}")]
    AlreadyTerminal(String),

    #[error("复制失败 {}: {reason}", path.display())]
    CopyFailed { path: PathBuf, reason: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("扫描失败 {key}: {reason}")]
    ScanFailed { key: String, reason: String },

    #[error("删除失败 {}: {reason}", path.display())]
    DeleteFailed { path: PathBuf, reason: String },

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error("配置错误: {0}")]
    Config(String),

    /// 使用记录 / 操作日志持久化失败
    #[error("存储错误: {0}")]
    Store(String),
}

impl SyncError {
    /// 稳定的错误标识，供宿主程序区分错误类型
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::InvalidPath(_) => "invalid_path",
            SyncError::UnknownCategory(_) => "unknown_category",
            SyncError::AlreadyExists(_) => "already_exists",
            SyncError::Busy(_) => "busy",
            SyncError::NotFound(_) => "not_found",
            SyncError::AlreadyTerminal(_) => "already_terminal",
            SyncError::CopyFailed { .. } => "copy_failed",
            SyncError::Cancelled => "cancelled",
            SyncError::ScanFailed { .. } => "scan_failed",
            SyncError::DeleteFailed { .. } => "delete_failed",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::Config(_) => "config",
            SyncError::Store(_) => "store",
        }
    }

    pub(crate) fn copy_failed(path: &Path, err: impl std::fmt::Display) -> Self {
        SyncError::CopyFailed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn delete_failed(path: &Path, err: impl std::fmt::Display) -> Self {
        SyncError::DeleteFailed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl Serialize for SyncError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("SyncError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_carries_kind() {
        let err = SyncError::Busy("job-1".to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "busy");
        assert!(value["message"].as_str().unwrap().contains("job-1"));
    }

    #[test]
    fn test_copy_failed_mentions_path() {
        let err = SyncError::copy_failed(Path::new("/cache/a.bin"), "disk full");
        assert_eq!(err.kind(), "copy_failed");
        assert!(err.to_string().contains("/cache/a.bin"));
        assert!(err.to_string().contains("disk full"));
    }
}
