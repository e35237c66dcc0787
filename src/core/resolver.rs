//! 路径解析：分类 + 相对路径 -> 绝对路径
//!
//! 所有文件系统路径都必须经由 [`PathResolver::resolve`] 生成，
//! 不允许在其他地方拼接字符串构造路径。

use crate::core::error::{SyncError, SyncResult};
use crate::core::registry::{lexical_normalize, CategoryRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// 存储端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Network,
}

/// 资源标识：分类 + 规范化后的相对路径（使用 `/` 分隔）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub category: String,
    pub relative_path: String,
}

impl AssetKey {
    /// 构造并规范化相对路径
    pub fn new(category: impl Into<String>, relative_path: &str) -> SyncResult<Self> {
        let category = category.into();
        if category.is_empty() {
            return Err(SyncError::InvalidRequest("分类不能为空".to_string()));
        }
        let relative_path = normalize_relpath(relative_path)
            .ok_or_else(|| SyncError::InvalidPath(relative_path.to_string()))?;
        Ok(Self {
            category,
            relative_path,
        })
    }

    /// 解析 `category/relative/path` 形式
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let raw = raw.trim().replace('\\', "/");
        let (category, rest) = raw
            .split_once('/')
            .ok_or_else(|| SyncError::InvalidPath(raw.clone()))?;
        Self::new(category, rest)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.relative_path)
    }
}

/// 规范化相对路径：统一分隔符、去掉 `.`，拒绝绝对路径、盘符、UNC 以及 `..`
pub fn normalize_relpath(raw: &str) -> Option<String> {
    let raw = raw.trim().replace('\\', "/");
    if raw.is_empty() || raw.starts_with('/') {
        return None;
    }
    // C:foo / C:/foo 之类的盘符前缀
    if raw.len() >= 2 && raw.as_bytes()[1] == b':' && raw.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }

    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// 路径解析器
#[derive(Debug, Clone)]
pub struct PathResolver {
    registry: Arc<CategoryRegistry>,
}

impl PathResolver {
    pub fn new(registry: Arc<CategoryRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    /// 返回分类在指定端的根目录
    pub fn root(&self, category: &str, side: Side) -> SyncResult<&Path> {
        let mapping = self.registry.get(category)?;
        Ok(match side {
            Side::Local => &mapping.local_root,
            Side::Network => &mapping.network_root,
        })
    }

    /// 解析资源在指定端的绝对路径
    pub fn resolve(&self, key: &AssetKey, side: Side) -> SyncResult<PathBuf> {
        let root = self.root(&key.category, side)?;
        let invalid = || SyncError::InvalidPath(key.relative_path.clone());

        let rel = Path::new(&key.relative_path);
        if rel.is_absolute() || rel.has_root() {
            return Err(invalid());
        }
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
        {
            return Err(invalid());
        }

        let root = lexical_normalize(root).ok_or_else(invalid)?;
        let full = lexical_normalize(&root.join(rel)).ok_or_else(invalid)?;
        if full == root || !full.starts_with(&root) {
            return Err(invalid());
        }
        Ok(full)
    }

    /// 同时解析两端路径
    pub fn resolve_pair(&self, key: &AssetKey) -> SyncResult<(PathBuf, PathBuf)> {
        Ok((
            self.resolve(key, Side::Local)?,
            self.resolve(key, Side::Network)?,
        ))
    }
}
