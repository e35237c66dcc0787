//! 本地缓存清理
//!
//! 按使用评分从低到高淘汰本地文件，直到总大小不超过预算。

use crate::config::PruneSettings;
use crate::core::action_log::{format_size, ActionEntry, ActionLog, PruneLogEntry, PruneReason};
use crate::core::error::{SyncError, SyncResult};
use crate::core::resolver::{AssetKey, PathResolver, Side};
use crate::core::scanner::Scanner;
use crate::core::usage::UsageStore;
use crate::db::UsageRecord;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// 使用评分权重
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageWeights {
    /// 最近使用分量的半衰期（毫秒）
    pub recency_half_life_ms: f64,
    pub recency_scale: f64,
    pub frequency_scale: f64,
}

impl Default for UsageWeights {
    fn default() -> Self {
        Self {
            recency_half_life_ms: 7.0 * MILLIS_PER_DAY,
            recency_scale: 1.0,
            frequency_scale: 0.25,
        }
    }
}

impl UsageWeights {
    /// 距今 age_ms 的最近使用分量，范围 (0, recency_scale]
    pub fn recency_weight(&self, age_ms: i64) -> f64 {
        let age = age_ms.max(0) as f64;
        if self.recency_half_life_ms <= 0.0 {
            return 0.0;
        }
        self.recency_scale * 0.5f64.powf(age / self.recency_half_life_ms)
    }

    /// 使用次数分量，对数增长
    pub fn frequency_weight(&self, use_count: u64) -> f64 {
        self.frequency_scale * (use_count as f64).ln_1p()
    }
}

/// 使用评分：越高越应保留
pub fn usage_score(last_used_at: i64, use_count: u64, now: i64, weights: &UsageWeights) -> f64 {
    weights.recency_weight(now.saturating_sub(last_used_at)) + weights.frequency_weight(use_count)
}

/// 淘汰候选
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub key: AssetKey,
    pub size: u64,
    pub last_used_at: i64,
    pub use_count: u64,
}

impl EvictionCandidate {
    /// 没有使用记录时以文件修改时间作为最近使用时间
    pub fn from_parts(key: AssetKey, size: u64, mtime_secs: i64, usage: Option<&UsageRecord>) -> Self {
        let (last_used_at, use_count) = match usage {
            Some(u) => (u.last_used_at, u.use_count),
            None => (mtime_secs.saturating_mul(1000), 0),
        };
        Self {
            key,
            size,
            last_used_at,
            use_count,
        }
    }
}

/// 计算淘汰计划
///
/// 按评分升序（同分时最久未使用优先）累计，直到 `总大小 - 已释放 <= max_bytes`。
/// `max_bytes == 0` 表示不限制。
pub fn plan_eviction(
    entries: &[EvictionCandidate],
    max_bytes: u64,
    now: i64,
    weights: &UsageWeights,
) -> Vec<AssetKey> {
    let total: u64 = entries.iter().map(|e| e.size).sum();
    if max_bytes == 0 || total <= max_bytes {
        return Vec::new();
    }

    let mut ranked: Vec<(f64, &EvictionCandidate)> = entries
        .iter()
        .map(|e| (usage_score(e.last_used_at, e.use_count, now, weights), e))
        .collect();
    ranked.sort_by(|(sa, a), (sb, b)| {
        sa.partial_cmp(sb)
            .unwrap_or(Ordering::Equal)
            .then(a.last_used_at.cmp(&b.last_used_at))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut freed = 0u64;
    let mut plan = Vec::new();
    for (_, entry) in ranked {
        if total - freed <= max_bytes {
            break;
        }
        freed += entry.size;
        plan.push(entry.key.clone());
    }
    plan
}

/// 清理触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTrigger {
    /// 任务完成后自动触发，受 `auto_delete_enabled` 控制
    Auto,
    /// 显式调用，总是执行
    Manual,
}

/// 清理结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub entries: Vec<PruneLogEntry>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_freed: u64,
}

/// 缓存清理器
#[derive(Debug, Clone)]
pub struct CachePruner {
    resolver: PathResolver,
    scanner: Scanner,
    usage: UsageStore,
    log: ActionLog,
    weights: UsageWeights,
}

impl CachePruner {
    pub fn new(resolver: PathResolver, scanner: Scanner, usage: UsageStore, log: ActionLog) -> Self {
        Self {
            resolver,
            scanner,
            usage,
            log,
            weights: UsageWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: UsageWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn weights(&self) -> &UsageWeights {
        &self.weights
    }

    /// 收集本地缓存的淘汰候选
    pub async fn candidates(&self) -> SyncResult<Vec<EvictionCandidate>> {
        let listing = self.scanner.local_files().await?;
        for e in &listing.errors {
            // 无法读取的文件不参与本次清理
            warn!("跳过无法读取的缓存文件: {}", e);
        }
        let usage = self.usage.snapshot().await.map_err(SyncError::store)?;
        Ok(listing
            .files
            .into_iter()
            .map(|f| {
                let record = usage.get(&f.key);
                EvictionCandidate::from_parts(f.key, f.size, f.modified_time, record)
            })
            .collect())
    }

    /// 执行清理
    ///
    /// 自动触发且未开启自动删除时不做任何事。单个文件删除失败不会中断计划，
    /// 会以 `delete_failed` 记录到日志并跳过。
    pub async fn prune(
        &self,
        settings: &PruneSettings,
        trigger: PruneTrigger,
    ) -> SyncResult<PruneReport> {
        if trigger == PruneTrigger::Auto && !settings.auto_delete_enabled {
            debug!("自动清理未开启，跳过");
            return Ok(PruneReport::default());
        }

        let candidates = self.candidates().await?;
        let bytes_before: u64 = candidates.iter().map(|c| c.size).sum();
        let now = chrono::Utc::now().timestamp_millis();
        let plan = plan_eviction(&candidates, settings.max_cache_bytes, now, &self.weights);

        if plan.is_empty() {
            debug!(
                "缓存 {} 未超出预算 {}，无需清理",
                format_size(bytes_before),
                format_size(settings.max_cache_bytes)
            );
            return Ok(PruneReport {
                entries: Vec::new(),
                bytes_before,
                bytes_after: bytes_before,
                bytes_freed: 0,
            });
        }

        let reason = match trigger {
            PruneTrigger::Auto => PruneReason::Auto,
            PruneTrigger::Manual => PruneReason::Manual,
        };
        let (entries, bytes_freed) = self.apply_plan(plan, &candidates, reason).await;

        let log_entries: Vec<ActionEntry> = entries.iter().cloned().map(ActionEntry::Prune).collect();
        if let Err(e) = self.log.append_all(&log_entries).await {
            warn!("写入清理日志失败: {}", e);
        }

        let bytes_after = bytes_before.saturating_sub(bytes_freed);
        info!(
            "清理完成: 释放 {} (清理前 {}, 清理后 {})",
            format_size(bytes_freed),
            format_size(bytes_before),
            format_size(bytes_after)
        );

        Ok(PruneReport {
            entries,
            bytes_before,
            bytes_after,
            bytes_freed,
        })
    }

    /// 按计划逐个删除，失败的条目记为 `delete_failed` 并继续
    async fn apply_plan(
        &self,
        plan: Vec<AssetKey>,
        candidates: &[EvictionCandidate],
        reason: PruneReason,
    ) -> (Vec<PruneLogEntry>, u64) {
        let mut entries = Vec::with_capacity(plan.len());
        let mut bytes_freed = 0u64;

        for key in plan {
            let size = candidates
                .iter()
                .find(|c| c.key == key)
                .map(|c| c.size)
                .unwrap_or(0);
            let timestamp = chrono::Utc::now().timestamp_millis();

            match self.delete_file(&key).await {
                Ok(()) => {
                    bytes_freed += size;
                    if let Err(e) = self.usage.remove(&key).await {
                        warn!("移除使用记录失败 {}: {}", key, e);
                    }
                    entries.push(PruneLogEntry {
                        timestamp,
                        key,
                        bytes_freed: size,
                        reason,
                    });
                }
                Err(e) => {
                    warn!("清理 {} 失败: {}", key, e);
                    entries.push(PruneLogEntry {
                        timestamp,
                        key,
                        bytes_freed: 0,
                        reason: PruneReason::DeleteFailed,
                    });
                }
            }
        }
        (entries, bytes_freed)
    }

    async fn delete_file(&self, key: &AssetKey) -> SyncResult<()> {
        let path = self.resolver.resolve(key, Side::Local)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| SyncError::delete_failed(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{CategoryMapping, CategoryRegistry};
    use std::sync::Arc;

    const NOW: i64 = 100 * 24 * 60 * 60 * 1000;

    fn candidate(name: &str, size: u64, last_used_at: i64, use_count: u64) -> EvictionCandidate {
        EvictionCandidate {
            key: AssetKey::new("checkpoints", name).unwrap(),
            size,
            last_used_at,
            use_count,
        }
    }

    fn names(plan: &[AssetKey]) -> Vec<&str> {
        plan.iter().map(|k| k.relative_path.as_str()).collect()
    }

    #[test]
    fn test_score_prefers_recent_and_frequent() {
        let w = UsageWeights::default();
        let day = MILLIS_PER_DAY as i64;
        assert!(usage_score(NOW - day, 1, NOW, &w) > usage_score(NOW - 30 * day, 1, NOW, &w));
        assert!(usage_score(NOW - day, 10, NOW, &w) > usage_score(NOW - day, 1, NOW, &w));
        assert!((w.recency_weight(0) - 1.0).abs() < 1e-9);
        assert!((w.recency_weight(7 * day) - 0.5).abs() < 1e-9);
        assert_eq!(w.frequency_weight(0), 0.0);
    }

    #[test]
    fn test_least_recent_evicted_first() {
        let entries = vec![
            candidate("c.pt", 100, NOW - 1_000, 1),
            candidate("a.pt", 100, NOW - 3_000_000_000, 1),
            candidate("b.pt", 100, NOW - 1_000_000_000, 1),
        ];
        let plan = plan_eviction(&entries, 200, NOW, &UsageWeights::default());
        assert_eq!(names(&plan), vec!["a.pt"]);

        let plan = plan_eviction(&entries, 100, NOW, &UsageWeights::default());
        assert_eq!(names(&plan), vec!["a.pt", "b.pt"]);
    }

    #[test]
    fn test_under_budget_or_unlimited_is_empty() {
        let entries = vec![candidate("a.pt", 100, 0, 0)];
        assert!(plan_eviction(&entries, 100, NOW, &UsageWeights::default()).is_empty());
        assert!(plan_eviction(&entries, 0, NOW, &UsageWeights::default()).is_empty());
        assert!(plan_eviction(&[], 10, NOW, &UsageWeights::default()).is_empty());
    }

    #[test]
    fn test_equal_score_tie_breaks_on_age() {
        // 最近使用权重为 0 时评分只取决于次数
        let weights = UsageWeights {
            recency_scale: 0.0,
            ..UsageWeights::default()
        };
        let entries = vec![
            candidate("newer.pt", 50, NOW - 10, 2),
            candidate("older.pt", 50, NOW - 20, 2),
        ];
        let plan = plan_eviction(&entries, 60, NOW, &weights);
        assert_eq!(names(&plan), vec!["older.pt"]);
    }

    #[test]
    fn test_frequency_can_outweigh_recency() {
        let entries = vec![
            candidate("hot.pt", 100, NOW - 2 * MILLIS_PER_DAY as i64, 50),
            candidate("cold.pt", 100, NOW - MILLIS_PER_DAY as i64, 0),
        ];
        let plan = plan_eviction(&entries, 150, NOW, &UsageWeights::default());
        assert_eq!(names(&plan), vec!["cold.pt"]);
    }

    #[test]
    fn test_missing_usage_falls_back_to_mtime() {
        let key = AssetKey::new("checkpoints", "a.pt").unwrap();
        let c = EvictionCandidate::from_parts(key, 10, 42, None);
        assert_eq!(c.last_used_at, 42_000);
        assert_eq!(c.use_count, 0);
    }

    async fn pruner(dir: &std::path::Path, local: &std::path::Path) -> CachePruner {
        let registry = CategoryRegistry::new(vec![CategoryMapping {
            name: "checkpoints".to_string(),
            local_root: local.to_path_buf(),
            network_root: dir.join("net/checkpoints"),
        }])
        .unwrap();
        let resolver = PathResolver::new(Arc::new(registry));
        let scanner = Scanner::new(resolver.clone());
        let db = crate::db::connect(dir).await.unwrap();
        CachePruner::new(resolver, scanner, UsageStore::new(Arc::new(db)), ActionLog::new(dir))
    }

    #[tokio::test]
    async fn test_failed_deletion_is_logged_and_plan_continues() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local/checkpoints");
        // 同名目录无法用 remove_file 删除
        std::fs::create_dir_all(local.join("stuck.pt")).unwrap();
        std::fs::write(local.join("stuck.pt/inner.bin"), b"x").unwrap();
        std::fs::write(local.join("old.pt"), vec![0u8; 30]).unwrap();
        let pruner = pruner(dir.path(), &local).await;

        let plan = vec![
            AssetKey::new("checkpoints", "stuck.pt").unwrap(),
            AssetKey::new("checkpoints", "old.pt").unwrap(),
        ];
        let candidates = vec![candidate("stuck.pt", 50, 0, 0), candidate("old.pt", 30, 0, 0)];
        let (entries, freed) = pruner.apply_plan(plan, &candidates, PruneReason::Manual).await;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key.relative_path, "stuck.pt");
        assert_eq!(entries[0].reason, PruneReason::DeleteFailed);
        assert_eq!(entries[0].bytes_freed, 0);
        assert_eq!(entries[1].key.relative_path, "old.pt");
        assert_eq!(entries[1].reason, PruneReason::Manual);
        assert_eq!(entries[1].bytes_freed, 30);
        assert_eq!(freed, 30);
        assert!(local.join("stuck.pt").is_dir());
        assert!(!local.join("old.pt").exists());
    }

    #[tokio::test]
    async fn test_candidates_skip_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local/checkpoints");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("a.pt"), vec![0u8; 12]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("loop.pt", local.join("loop.pt")).unwrap();
        let pruner = pruner(dir.path(), &local).await;

        let candidates = pruner.candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key.relative_path, "a.pt");
        assert_eq!(candidates[0].size, 12);
    }
}
