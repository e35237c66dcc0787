//! 分类注册表：分类名 -> 本地根目录 / 网络根目录
//!
//! 启动时从 YAML 配置加载一次，进程生命周期内不可变。

use crate::core::error::{SyncError, SyncResult};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// 单个分类的两端根目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryMapping {
    pub name: String,
    pub local_root: PathBuf,
    pub network_root: PathBuf,
}

/// 分类注册表（纯查询，无可变状态）
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    categories: BTreeMap<String, CategoryMapping>,
}

impl CategoryRegistry {
    pub fn new(mappings: Vec<CategoryMapping>) -> SyncResult<Self> {
        let mut categories = BTreeMap::new();
        for mapping in mappings {
            if !mapping.local_root.is_absolute() || !mapping.network_root.is_absolute() {
                return Err(SyncError::Config(format!(
                    "分类 {} 的根目录必须是绝对路径",
                    mapping.name
                )));
            }
            if categories.contains_key(&mapping.name) {
                return Err(SyncError::Config(format!("分类重复: {}", mapping.name)));
            }
            categories.insert(mapping.name.clone(), mapping);
        }
        Ok(Self { categories })
    }

    /// 从 YAML 文件加载
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("无法读取分类配置 {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// 解析分类配置
    ///
    /// ```yaml
    /// local:
    ///   base_path: /cache
    ///   checkpoints: checkpoints
    ///   loras: [loras, loras_alt]
    /// network:
    ///   base_path: /net
    ///   checkpoints: checkpoints
    /// ```
    ///
    /// 某个值配置为列表时只有第一项生效，其余项被忽略。
    pub fn from_yaml_str(content: &str) -> SyncResult<Self> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| SyncError::Config(format!("分类配置解析失败: {}", e)))?;

        let local = Self::side_dirs(&doc, "local")?;
        let network = Self::side_dirs(&doc, "network")?;

        let mut mappings = Vec::new();
        for (name, local_root) in &local {
            match network.get(name) {
                Some(network_root) => mappings.push(CategoryMapping {
                    name: name.clone(),
                    local_root: local_root.clone(),
                    network_root: network_root.clone(),
                }),
                None => warn!("分类 {} 只配置了本地目录，已忽略", name),
            }
        }
        for name in network.keys().filter(|n| !local.contains_key(*n)) {
            warn!("分类 {} 只配置了网络目录，已忽略", name);
        }

        debug!("加载了 {} 个分类", mappings.len());
        Self::new(mappings)
    }

    /// 解析一端的 base_path 及各分类子目录
    fn side_dirs(doc: &Value, side: &str) -> SyncResult<BTreeMap<String, PathBuf>> {
        let section = doc
            .get(side)
            .and_then(Value::as_mapping)
            .ok_or_else(|| SyncError::Config(format!("缺少 {} 配置段", side)))?;

        let base = section
            .get("base_path")
            .and_then(first_path)
            .map(PathBuf::from)
            .ok_or_else(|| SyncError::Config(format!("{}.base_path 未设置", side)))?;
        if !base.is_absolute() {
            return Err(SyncError::Config(format!("{}.base_path 必须是绝对路径", side)));
        }

        let mut dirs = BTreeMap::new();
        for (key, value) in section {
            let Some(name) = key.as_str() else { continue };
            if name == "base_path" {
                continue;
            }
            let Some(subdir) = first_path(value) else {
                continue;
            };
            match category_root(&base, Path::new(&subdir)) {
                Some(root) => {
                    dirs.insert(name.to_string(), root);
                }
                None => warn!("分类 {} 的目录 {} 超出 {}，已忽略", name, subdir, base.display()),
            }
        }
        Ok(dirs)
    }

    pub fn get(&self, name: &str) -> SyncResult<&CategoryMapping> {
        self.categories
            .get(name)
            .ok_or_else(|| SyncError::UnknownCategory(name.to_string()))
    }

    /// 按名称排序的分类列表
    pub fn categories(&self) -> impl Iterator<Item = &CategoryMapping> {
        self.categories.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// 去重后的本地根目录
    pub fn local_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.categories().map(|c| c.local_root.clone()).collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

/// 字符串直接返回；列表取第一个非空字符串
fn first_path(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Sequence(items) => items
            .iter()
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// 子目录（相对或绝对）必须落在 base 之内
fn category_root(base: &Path, subdir: &Path) -> Option<PathBuf> {
    let joined = if subdir.is_absolute() {
        subdir.to_path_buf()
    } else {
        base.join(subdir)
    };
    let normalized = lexical_normalize(&joined)?;
    let base = lexical_normalize(base)?;
    normalized.starts_with(&base).then_some(normalized)
}

/// 词法规范化（不访问文件系统），`..` 越过根时返回 None
pub(crate) fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
local:
  base_path: /cache
  checkpoints: checkpoints
  loras: [loras, loras_alt]
  vae: vae
network:
  base_path: /net
  checkpoints: checkpoints
  loras: loras
  upscale: upscale
"#;

    #[test]
    fn test_parse_pairs_both_sides() {
        let registry = CategoryRegistry::from_yaml_str(CONFIG).unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["checkpoints", "loras"]);

        let ckpt = registry.get("checkpoints").unwrap();
        assert_eq!(ckpt.local_root, PathBuf::from("/cache/checkpoints"));
        assert_eq!(ckpt.network_root, PathBuf::from("/net/checkpoints"));
    }

    #[test]
    fn test_list_value_first_entry_wins() {
        let registry = CategoryRegistry::from_yaml_str(CONFIG).unwrap();
        assert_eq!(
            registry.get("loras").unwrap().local_root,
            PathBuf::from("/cache/loras")
        );
    }

    #[test]
    fn test_unknown_category() {
        let registry = CategoryRegistry::from_yaml_str(CONFIG).unwrap();
        assert!(matches!(
            registry.get("vae"),
            Err(SyncError::UnknownCategory(name)) if name == "vae"
        ));
    }

    #[test]
    fn test_escaping_subdir_is_dropped() {
        let config = r#"
local:
  base_path: /cache
  evil: ../etc
  abs: /elsewhere/models
network:
  base_path: /net
  evil: evil
  abs: abs
"#;
        let registry = CategoryRegistry::from_yaml_str(config).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_base_path() {
        let config = "local:\n  checkpoints: c\nnetwork:\n  base_path: /net\n";
        assert!(matches!(
            CategoryRegistry::from_yaml_str(config),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mapping = CategoryMapping {
            name: "a".into(),
            local_root: "/l/a".into(),
            network_root: "/n/a".into(),
        };
        assert!(CategoryRegistry::new(vec![mapping.clone(), mapping]).is_err());
    }
}
