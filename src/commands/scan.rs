//! 扫描相关命令

use crate::core::pruner::usage_score;
use crate::core::{format_size, AssetStatus, SyncError, SyncResult};
use crate::db::{UsageKind, UsageRecord};
use crate::AppState;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub items: Vec<AssetStatus>,
    /// 单个资源的扫描错误，不影响其他资源
    pub errors: Vec<SyncError>,
    pub cache_size_bytes: u64,
    pub cache_size_human: String,
}

/// 本地缓存条目，附带使用记录和评分
#[derive(Debug, Clone, Serialize)]
pub struct LocalEntry {
    #[serde(flatten)]
    pub status: AssetStatus,
    pub usage: Option<UsageRecord>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListLocalResponse {
    pub items: Vec<LocalEntry>,
    pub errors: Vec<SyncError>,
    pub cache_size_bytes: u64,
    pub cache_size_human: String,
}

/// 匹配外部提供的候选字符串并返回两端状态
///
/// 命中的资源记录一次访问。
pub async fn scan(state: &AppState, candidates: &[String]) -> SyncResult<ScanResponse> {
    let report = state.scanner.scan_candidates(candidates).await;

    let keys: Vec<_> = report.items.iter().map(|s| s.key.clone()).collect();
    if let Err(e) = state.usage.touch(&keys, UsageKind::Access).await {
        warn!("记录访问失败: {}", e);
    }

    let cache_size_bytes = state.scanner.cache_size().await;
    Ok(ScanResponse {
        items: report.items,
        errors: report.errors,
        cache_size_bytes,
        cache_size_human: format_size(cache_size_bytes),
    })
}

/// 列出本地缓存，按评分从高到低排序
///
/// 需要遍历所有本地目录，文件很多时较慢。
pub async fn list_local(state: &AppState) -> SyncResult<ListLocalResponse> {
    let report = state.scanner.scan_all_local().await?;
    let usage = state.usage.snapshot().await.map_err(SyncError::store)?;
    let weights = *state.pruner.weights();
    let now = chrono::Utc::now().timestamp_millis();

    let mut items: Vec<LocalEntry> = report
        .items
        .into_iter()
        .map(|status| {
            let record = usage.get(&status.key).cloned();
            let (last_used_at, use_count) = match &record {
                Some(r) => (r.last_used_at, r.use_count),
                None => (status.local_mtime.unwrap_or(0).saturating_mul(1000), 0),
            };
            LocalEntry {
                score: usage_score(last_used_at, use_count, now, &weights),
                usage: record,
                status,
            }
        })
        .collect();
    items.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.status.key.cmp(&b.status.key)));

    let cache_size_bytes = state.scanner.cache_size().await;
    Ok(ListLocalResponse {
        items,
        errors: report.errors,
        cache_size_bytes,
        cache_size_human: format_size(cache_size_bytes),
    })
}
