//! 应用配置模块
//!
//! 所有配置保存在数据目录下的 `config.json`，每个模块占用一个独立的节。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const DEFAULT_CATEGORIES_FILE: &str = "categories.yaml";

/// 默认缓存上限 200GB
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 200 * 1024 * 1024 * 1024;

fn read_config(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// 读取某个配置节，不存在或格式错误时返回 None
pub(crate) fn read_section<T: DeserializeOwned>(config_dir: &Path, section: &str) -> Option<T> {
    let config = read_config(config_dir)?;
    serde_json::from_value(config.get(section)?.clone()).ok()
}

/// 写入某个配置节，保留其他节
pub(crate) fn write_section<T: Serialize>(config_dir: &Path, section: &str, value: &T) -> io::Result<()> {
    let mut config = read_config(config_dir).unwrap_or_else(|| serde_json::json!({}));
    if !config.is_object() {
        config = serde_json::json!({});
    }
    config[section] = serde_json::to_value(value)?;

    let content = serde_json::to_string_pretty(&config)?;
    fs::write(config_dir.join(CONFIG_FILE), content)
}

/// 缓存清理设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneSettings {
    /// 任务完成后是否自动清理
    #[serde(default)]
    pub auto_delete_enabled: bool,
    /// 本地缓存上限（字节），0 表示不限制
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
}

fn default_max_cache_bytes() -> u64 {
    DEFAULT_MAX_CACHE_BYTES
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            auto_delete_enabled: false,
            max_cache_bytes: default_max_cache_bytes(),
        }
    }
}

impl PruneSettings {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "prune").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "prune", self)
    }
}

/// 传输配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 分块大小（MB）
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u32,
}

fn default_chunk_size_mb() -> u32 {
    16
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
        }
    }
}

impl TransferConfig {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "transfer").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "transfer", self)
    }

    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_mb.clamp(1, 1024) as usize * 1024 * 1024
    }
}

/// 分类配置文件路径：`categories_file`，相对路径基于数据目录
pub fn categories_file(config_dir: &Path) -> PathBuf {
    read_section::<String>(config_dir, "categories_file")
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { config_dir.join(p) })
        .unwrap_or_else(|| config_dir.join(DEFAULT_CATEGORIES_FILE))
}

/// 自定义数据路径（`data_path`），必须是已存在的目录
pub fn data_path_override(config_dir: &Path) -> Option<PathBuf> {
    read_section::<String>(config_dir, "data_path")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PruneSettings::load(dir.path()), PruneSettings::default());

        let prune = PruneSettings {
            auto_delete_enabled: true,
            max_cache_bytes: 1024,
        };
        prune.save(dir.path()).unwrap();
        TransferConfig { chunk_size_mb: 4 }.save(dir.path()).unwrap();

        assert_eq!(PruneSettings::load(dir.path()), prune);
        assert_eq!(TransferConfig::load(dir.path()).chunk_size_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"prune": {"auto_delete_enabled": true}, "categories_file": "models.yaml"}"#,
        )
        .unwrap();

        let prune = PruneSettings::load(dir.path());
        assert!(prune.auto_delete_enabled);
        assert_eq!(prune.max_cache_bytes, DEFAULT_MAX_CACHE_BYTES);
        assert_eq!(categories_file(dir.path()), dir.path().join("models.yaml"));
    }

    #[test]
    fn test_default_categories_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(categories_file(dir.path()), dir.path().join("categories.yaml"));
    }
}
