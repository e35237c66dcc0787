//! 本地缓存相关命令：删除、清理设置、手动清理

use crate::config::PruneSettings;
use crate::core::{
    ActionEntry, AssetKey, PruneLogEntry, PruneTrigger, Side, SyncError, SyncResult,
};
use crate::core::scanner::stat_file;
use crate::AppState;
use serde::Serialize;
use std::sync::PoisonError;
use tracing::{info, warn};

/// 批量删除中单个资源的结果
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub key: AssetKey,
    pub error: Option<SyncError>,
}

/// 删除一个本地缓存文件
pub async fn delete_local(state: &AppState, category: &str, relative_path: &str) -> SyncResult<()> {
    let key = AssetKey::new(category, relative_path)?;
    delete_key(state, &key).await
}

async fn delete_key(state: &AppState, key: &AssetKey) -> SyncResult<()> {
    let path = state.resolver.resolve(key, Side::Local)?;

    match stat_file(&path).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(SyncError::NotFound(key.to_string())),
        Err(e) => return Err(SyncError::delete_failed(&path, e)),
    }
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| SyncError::delete_failed(&path, e))?;

    if let Err(e) = state.usage.remove(key).await {
        warn!("移除使用记录失败 {}: {}", key, e);
    }
    let entry = ActionEntry::DeleteLocal {
        timestamp: chrono::Utc::now().timestamp_millis(),
        key: key.clone(),
    };
    if let Err(e) = state.action_log.append(entry).await {
        warn!("写入操作日志失败: {}", e);
    }

    info!("已删除本地缓存: {}", key);
    Ok(())
}

/// 批量删除，单个失败不影响其他
pub async fn delete_local_batch(state: &AppState, keys: Vec<AssetKey>) -> Vec<DeleteResult> {
    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
        let error = delete_key(state, &key).await.err();
        results.push(DeleteResult { key, error });
    }
    results
}

/// 获取清理设置
pub fn get_settings(state: &AppState) -> PruneSettings {
    *state.settings.read().unwrap_or_else(PoisonError::into_inner)
}

/// 修改清理设置并持久化
pub fn set_settings(
    state: &AppState,
    auto_delete_enabled: Option<bool>,
    max_cache_bytes: Option<u64>,
) -> SyncResult<PruneSettings> {
    let mut settings = get_settings(state);
    if let Some(enabled) = auto_delete_enabled {
        settings.auto_delete_enabled = enabled;
    }
    if let Some(max) = max_cache_bytes {
        settings.max_cache_bytes = max;
    }

    settings
        .save(&state.config_dir)
        .map_err(|e| SyncError::Config(e.to_string()))?;
    *state.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;

    info!(
        "清理设置已更新: auto_delete_enabled={}, max_cache_bytes={}",
        settings.auto_delete_enabled, settings.max_cache_bytes
    );
    Ok(settings)
}

/// 立即清理，不受 `auto_delete_enabled` 影响
///
/// `max_cache_bytes` 只对本次清理生效，不会保存到设置中。
pub async fn prune_now(
    state: &AppState,
    max_cache_bytes: Option<u64>,
) -> SyncResult<Vec<PruneLogEntry>> {
    let mut settings = get_settings(state);
    if let Some(max) = max_cache_bytes {
        settings.max_cache_bytes = max;
    }
    let report = state.pruner.prune(&settings, PruneTrigger::Manual).await?;
    Ok(report.entries)
}

/// 读取操作日志（最近 200 行）
pub async fn get_prune_log(state: &AppState) -> SyncResult<String> {
    state.action_log.read_text().await.map_err(SyncError::store)
}
