use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod logging;

pub use crate::config::PruneSettings;
pub use crate::core::{
    AssetKey, AssetStatus, CategoryRegistry, JobKind, JobManager, JobSnapshot, JobState,
    SyncError, SyncResult, SyncStatus,
};

use crate::config::TransferConfig;
use crate::core::{
    ActionLog, CachePruner, CopyEngine, PathResolver, Scanner, SharedSettings, UsageStore,
};
use sqlx::SqlitePool;

/// 应用状态，在各个命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub db: Arc<SqlitePool>,
    pub registry: Arc<CategoryRegistry>,
    pub resolver: PathResolver,
    pub scanner: Scanner,
    pub usage: UsageStore,
    pub action_log: ActionLog,
    /// 清理设置，`set_settings` 修改后立即对后续任务生效
    pub settings: SharedSettings,
    pub pruner: CachePruner,
    pub jobs: JobManager,
}

impl AppState {
    /// 使用默认数据目录初始化；`categories` 覆盖配置中的分类文件
    pub async fn new(categories: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_dir = dirs::data_dir();
        std::fs::create_dir_all(&config_dir)?;

        let categories = categories.unwrap_or_else(|| config::categories_file(&config_dir));
        tracing::debug!("加载分类配置: {:?}", categories);
        let registry = CategoryRegistry::load(&categories)?;

        Self::open(&config_dir, registry).await
    }

    /// 在指定数据目录上初始化
    pub async fn open(config_dir: &Path, registry: CategoryRegistry) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;

        let db = Arc::new(db::connect(config_dir).await?);
        let registry = Arc::new(registry);
        let resolver = PathResolver::new(registry.clone());
        let scanner = Scanner::new(resolver.clone());
        let usage = UsageStore::new(db.clone());
        let action_log = ActionLog::new(config_dir);
        let settings: SharedSettings = Arc::new(RwLock::new(PruneSettings::load(config_dir)));
        let pruner = CachePruner::new(
            resolver.clone(),
            scanner.clone(),
            usage.clone(),
            action_log.clone(),
        );
        let engine = CopyEngine::with_chunk_size(TransferConfig::load(config_dir).chunk_size_bytes());
        let jobs = JobManager::new(
            resolver.clone(),
            scanner.clone(),
            engine,
            usage.clone(),
            action_log.clone(),
            pruner.clone(),
            settings.clone(),
        );

        tracing::info!(
            "已加载 {} 个分类，数据目录: {:?}",
            registry.categories().count(),
            config_dir
        );

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            db,
            registry,
            resolver,
            scanner,
            usage,
            action_log,
            settings,
            pruner,
            jobs,
        })
    }

    /// 替换复制引擎（分块大小），只应在没有任务运行时调用
    pub fn with_engine(mut self, engine: CopyEngine) -> Self {
        self.jobs = JobManager::new(
            self.resolver.clone(),
            self.scanner.clone(),
            engine,
            self.usage.clone(),
            self.action_log.clone(),
            self.pruner.clone(),
            self.settings.clone(),
        );
        self
    }

    /// 清理资源（退出时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        if let Some(job_id) = self.jobs.active_job() {
            tracing::debug!("取消任务: {}", job_id);
            let _ = self.jobs.cancel(&job_id);
        }

        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;

        tracing::info!("资源清理完成");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    const APP_DIR: &str = "modelsync";

    /// 平台默认的数据目录
    pub fn default_data_dir() -> PathBuf {
        let base = if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_STATE_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local").join("state"))
                })
        };
        base.map(|p| p.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".modelsync"))
    }

    /// 实际数据目录：默认目录下 config.json 的 `data_path` 优先
    pub fn data_dir() -> PathBuf {
        let default_dir = default_data_dir();
        crate::config::data_path_override(&default_dir)
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_dir)
    }
}
