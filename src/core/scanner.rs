use crate::core::error::{SyncError, SyncResult};
use crate::core::resolver::{normalize_relpath, AssetKey, PathResolver, Side};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 默认视为模型文件的扩展名
pub const MODEL_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin", "gguf"];

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 仅包含的扩展名（空表示不限制）
    pub include_extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_extensions: MODEL_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ScanConfig {
    /// 按扩展名判断是否为模型文件
    pub fn is_allowed(&self, path: &str) -> bool {
        if self.include_extensions.is_empty() {
            return true;
        }
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        self.include_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&ext))
    }
}

/// 文件元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
}

/// 两端对比状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    MissingBoth,
    LocalOnly,
    NetworkOnly,
    InSync,
    DifferentSize,
}

impl SyncStatus {
    fn derive(local: Option<FileMeta>, network: Option<FileMeta>) -> Self {
        match (local, network) {
            (None, None) => SyncStatus::MissingBoth,
            (Some(_), None) => SyncStatus::LocalOnly,
            (None, Some(_)) => SyncStatus::NetworkOnly,
            (Some(l), Some(n)) if l.size == n.size => SyncStatus::InSync,
            (Some(_), Some(_)) => SyncStatus::DifferentSize,
        }
    }
}

/// 单个资源的状态（派生数据，不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetStatus {
    pub key: AssetKey,
    pub local_exists: bool,
    pub local_size: Option<u64>,
    pub local_mtime: Option<i64>,
    pub network_exists: bool,
    pub network_size: Option<u64>,
    pub status: SyncStatus,
}

impl AssetStatus {
    fn new(key: AssetKey, local: Option<FileMeta>, network: Option<FileMeta>) -> Self {
        Self {
            key,
            local_exists: local.is_some(),
            local_size: local.map(|m| m.size),
            local_mtime: local.map(|m| m.modified_time),
            network_exists: network.is_some(),
            network_size: network.map(|m| m.size),
            status: SyncStatus::derive(local, network),
        }
    }
}

/// 本地缓存中的一个文件
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub key: AssetKey,
    pub size: u64,
    pub modified_time: i64,
}

/// 本地缓存遍历结果
#[derive(Debug, Clone, Default)]
pub struct LocalListing {
    pub files: Vec<LocalFile>,
    pub errors: Vec<SyncError>,
}

/// 批量扫描结果：单个资源失败不影响其他资源
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub items: Vec<AssetStatus>,
    pub errors: Vec<SyncError>,
}

/// 获取文件元数据；文件不存在（或是目录）时返回 None
pub async fn stat_file(path: &Path) -> std::io::Result<Option<FileMeta>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => {
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            Ok(Some(FileMeta {
                size: metadata.len(),
                modified_time: modified,
            }))
        }
        Ok(_) => Ok(None),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(None),
        Err(e) => Err(e),
    }
}

/// 去掉候选字符串末尾的 ` [...]` 标注
fn strip_bracket_suffix(raw: &str) -> &str {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let re = SUFFIX.get_or_init(|| Regex::new(r"^(.*?) \[[^\]]*\]$").expect("valid regex"));
    re.captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
}

/// 候选字符串在某个分类下可能对应的相对路径
fn candidate_relpaths(raw: &str, category: &str) -> Vec<String> {
    let Some(rel) = normalize_relpath(strip_bracket_suffix(raw)) else {
        return Vec::new();
    };
    let exact = rel
        .strip_prefix(&format!("{}/", category))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(rel);

    let mut variants = vec![exact.clone()];
    if let Some(name) = exact.rsplit('/').next() {
        if name != exact {
            variants.push(name.to_string());
        }
    }
    variants
}

/// 资源扫描器
#[derive(Debug, Clone)]
pub struct Scanner {
    resolver: PathResolver,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(resolver: PathResolver, config: ScanConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// 获取某一端的文件元数据
    pub async fn stat(&self, key: &AssetKey, side: Side) -> SyncResult<Option<FileMeta>> {
        let path = self.resolver.resolve(key, side)?;
        stat_file(&path).await.map_err(|e| SyncError::ScanFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// 扫描单个资源
    pub async fn scan_one(&self, key: &AssetKey) -> SyncResult<AssetStatus> {
        let local = self.stat(key, Side::Local).await?;
        let network = self.stat(key, Side::Network).await?;
        Ok(AssetStatus::new(key.clone(), local, network))
    }

    /// 按资源标识扫描，每个资源单独返回结果
    pub async fn scan(&self, keys: &[AssetKey]) -> Vec<SyncResult<AssetStatus>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.scan_one(key).await);
        }
        results
    }

    /// 将外部提供的候选字符串匹配到已知分类，忽略无法匹配的字符串
    pub async fn scan_candidates(&self, candidates: &[String]) -> ScanReport {
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();
        let categories: Vec<String> = self.resolver.registry().names().map(str::to_string).collect();

        for candidate in candidates {
            for category in &categories {
                for relpath in candidate_relpaths(candidate, category) {
                    if !self.config.is_allowed(&relpath) {
                        continue;
                    }
                    let Ok(key) = AssetKey::new(category.clone(), &relpath) else {
                        continue;
                    };
                    match self.scan_one(&key).await {
                        Ok(status) if status.status == SyncStatus::MissingBoth => continue,
                        Ok(status) => {
                            if seen.insert(key) {
                                report.items.push(status);
                            }
                            break;
                        }
                        Err(e) => {
                            warn!("扫描候选 {} 失败: {}", key, e);
                            report.errors.push(e);
                            break;
                        }
                    }
                }
            }
        }

        report.items.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("候选匹配: {} 个输入, {} 个命中", candidates.len(), report.items.len());
        report
    }

    /// 列出所有分类本地目录下的模型文件
    ///
    /// 指向文件的符号链接按目标文件计入，不进入链接指向的目录。遍历或读取元数据失败的条目
    /// 记录在 [`LocalListing::errors`] 中，不影响其他文件。
    /// 需要遍历全部本地目录，文件很多时较慢；需要频繁刷新时应使用 [`Scanner::scan`]。
    pub async fn local_files(&self) -> SyncResult<LocalListing> {
        let roots: Vec<(String, PathBuf)> = self
            .resolver
            .registry()
            .categories()
            .map(|c| (c.name.clone(), c.local_root.clone()))
            .collect();
        let config = self.config.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || {
            let mut listing = LocalListing::default();
            for (category, root) in roots {
                if !root.is_dir() {
                    continue;
                }
                walk_category(&category, &root, &config, &mut listing);
            }
            listing
        })
        .await
        .map_err(|e| SyncError::ScanFailed {
            key: "*".to_string(),
            reason: e.to_string(),
        })
    }

    /// 扫描整个本地缓存，并对照网络端状态
    pub async fn scan_all_local(&self) -> SyncResult<ScanReport> {
        let listing = self.local_files().await?;
        info!(
            "本地缓存共 {} 个模型文件, {} 个条目无法读取",
            listing.files.len(),
            listing.errors.len()
        );

        let mut report = ScanReport {
            items: Vec::with_capacity(listing.files.len()),
            errors: listing.errors,
        };
        for file in listing.files {
            // 遍历得到的路径同样要经过解析器校验
            if let Err(e) = self.resolver.resolve(&file.key, Side::Local) {
                report.errors.push(e);
                continue;
            }
            match self.stat(&file.key, Side::Network).await {
                Ok(network) => {
                    let local = FileMeta {
                        size: file.size,
                        modified_time: file.modified_time,
                    };
                    report.items.push(AssetStatus::new(file.key, Some(local), network));
                }
                Err(e) => report.errors.push(e),
            }
        }
        report.items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(report)
    }

    /// 本地缓存总大小（所有本地根目录下的全部文件，符号链接按目标文件计算）
    pub async fn cache_size(&self) -> u64 {
        let roots = self.resolver.registry().local_roots();
        let result = tokio::task::spawn_blocking(move || {
            let mut seen = HashSet::new();
            let mut total = 0u64;
            for entry in roots.iter().flat_map(|root| WalkDir::new(root).follow_links(false)) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("遍历本地缓存失败: {}", e);
                        continue;
                    }
                };
                if !seen.insert(entry.path().to_path_buf()) {
                    continue;
                }
                match file_metadata(&entry) {
                    Ok(Some(metadata)) => total += metadata.len(),
                    Ok(None) => {}
                    Err(e) => warn!("读取 {} 失败: {}", entry.path().display(), e),
                }
            }
            total
        })
        .await;

        match result {
            Ok(total) => total,
            Err(e) => {
                warn!("统计本地缓存大小失败: {}", e);
                0
            }
        }
    }
}

/// 遍历条目对应的普通文件元数据，跟随符号链接
///
/// 目录、指向目录的链接和悬空链接返回 None。
fn file_metadata(entry: &walkdir::DirEntry) -> std::io::Result<Option<std::fs::Metadata>> {
    if entry.file_type().is_dir() {
        return Ok(None);
    }
    match std::fs::metadata(entry.path()) {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn walk_category(category: &str, root: &Path, config: &ScanConfig, listing: &mut LocalListing) {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let key = e.path().unwrap_or(root).display().to_string();
                warn!("遍历 {} 失败: {}", key, e);
                listing.errors.push(SyncError::ScanFailed {
                    key,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if !config.is_allowed(&rel) {
            continue;
        }
        let Ok(key) = AssetKey::new(category, &rel) else {
            continue;
        };
        let metadata = match file_metadata(&entry) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => continue,
            Err(e) => {
                warn!("读取 {} 失败: {}", key, e);
                listing.errors.push(SyncError::ScanFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let modified_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        listing.files.push(LocalFile {
            key,
            size: metadata.len(),
            modified_time,
        });
    }
}
