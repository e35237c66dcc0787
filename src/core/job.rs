//! 复制任务管理
//!
//! 全局只有一个任务槽：`start` 原子地检查并占用槽位，已有任务时立即返回
//! [`SyncError::Busy`]，不会排队。任务状态只保存在内存中，进程重启后丢失。

use crate::config::PruneSettings;
use crate::core::action_log::{format_size, ActionEntry, ActionLog};
use crate::core::error::{SyncError, SyncResult};
use crate::core::pruner::{CachePruner, PruneTrigger};
use crate::core::resolver::{AssetKey, PathResolver, Side};
use crate::core::scanner::{stat_file, Scanner};
use crate::core::transfer::CopyEngine;
use crate::core::usage::UsageStore;
use crate::db::UsageKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 内存中保留的已结束任务数量
const MAX_FINISHED_JOBS: usize = 32;

/// 进度日志最小间隔
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// 进程内共享的清理设置
pub type SharedSettings = Arc<RwLock<PruneSettings>>;

/// 进度回调，在任务锁释放后调用
pub type ProgressObserver = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// 网络端 -> 本地
    Localize,
    /// 本地 -> 网络端
    Upload,
}

impl JobKind {
    /// (源端, 目标端)
    pub fn sides(self) -> (Side, Side) {
        match self {
            JobKind::Localize => (Side::Network, Side::Local),
            JobKind::Upload => (Side::Local, Side::Network),
        }
    }
}

/// 任务状态：queued -> running -> {done | error | cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Cancelled)
    }
}

/// 单项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Copying,
    Done,
    Failed,
    /// 目标已存在且大小一致
    Skipped,
    Cancelled,
}

/// 提交的任务项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub key: AssetKey,
    #[serde(default)]
    pub overwrite: bool,
}

impl JobRequest {
    pub fn new(key: AssetKey, overwrite: bool) -> Self {
        Self { key, overwrite }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobItem {
    pub key: AssetKey,
    pub overwrite: bool,
    pub state: ItemState,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub error: Option<SyncError>,
}

/// 任务对象，仅由 [`JobManager`] 修改
#[derive(Debug)]
struct CopyJob {
    id: String,
    kind: JobKind,
    items: Vec<JobItem>,
    state: JobState,
    created_at: i64,
    finished_at: Option<i64>,
    bytes_total: u64,
    bytes_done: u64,
    /// 失败、跳过、取消的项所占字节，只用于计算百分比
    bytes_settled: u64,
    current_item_index: Option<usize>,
    cancel_requested: bool,
    cancel: CancellationToken,
    message: Option<String>,
    last_progress_log: Instant,
    last_logged_percent: u32,
}

impl CopyJob {
    fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.state.is_terminal() { 100.0 } else { 0.0 };
        }
        let progressed = self.bytes_done.saturating_add(self.bytes_settled) as f64;
        (progressed / self.bytes_total as f64 * 100.0).min(100.0)
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            percent: self.percent(),
            bytes_total: self.bytes_total,
            bytes_done: self.bytes_done,
            current_item: self.current_item_index,
            current_key: self
                .current_item_index
                .and_then(|i| self.items.get(i))
                .map(|item| item.key.clone()),
            message: self.message.clone(),
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            finished_at: self.finished_at,
            items: self.items.clone(),
        }
    }

    /// 把当前项已复制的字节移出 bytes_done，百分比保持不回退
    fn settle_item(&mut self, index: usize, full: bool) {
        let item = &mut self.items[index];
        let partial = item.bytes_done;
        item.bytes_done = 0;
        self.bytes_done = self.bytes_done.saturating_sub(partial);
        self.bytes_settled += if full {
            partial.max(item.bytes_total)
        } else {
            partial
        };
    }
}

/// 任务只读快照
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub percent: f64,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub current_item: Option<usize>,
    pub current_key: Option<AssetKey>,
    pub message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub items: Vec<JobItem>,
}

#[derive(Default)]
struct Slot {
    current: Option<String>,
    jobs: HashMap<String, CopyJob>,
    finished: VecDeque<String>,
}

struct Inner {
    slot: Mutex<Slot>,
    resolver: PathResolver,
    scanner: Scanner,
    engine: CopyEngine,
    usage: UsageStore,
    log: ActionLog,
    pruner: CachePruner,
    settings: SharedSettings,
}

enum ItemOutcome {
    Copied(u64),
    Skipped,
}

/// 任务管理器
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        resolver: PathResolver,
        scanner: Scanner,
        engine: CopyEngine,
        usage: UsageStore,
        log: ActionLog,
        pruner: CachePruner,
        settings: SharedSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::default()),
                resolver,
                scanner,
                engine,
                usage,
                log,
                pruner,
                settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_job<R>(&self, id: &str, f: impl FnOnce(&mut CopyJob) -> R) -> Option<R> {
        self.lock().jobs.get_mut(id).map(f)
    }

    fn settings(&self) -> PruneSettings {
        *self
            .inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 提交任务
    pub async fn start(&self, kind: JobKind, requests: Vec<JobRequest>) -> SyncResult<String> {
        self.start_with_observer(kind, requests, None).await
    }

    /// 提交任务，并在每次进度变化时回调 `observer`
    pub async fn start_with_observer(
        &self,
        kind: JobKind,
        requests: Vec<JobRequest>,
        observer: Option<ProgressObserver>,
    ) -> SyncResult<String> {
        if requests.is_empty() {
            return Err(SyncError::InvalidRequest("任务列表为空".to_string()));
        }
        if let Some(active) = self.active_job() {
            return Err(SyncError::Busy(active));
        }

        let (source_side, _) = kind.sides();
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            // 路径错误在产生任何副作用之前同步返回
            self.inner.resolver.resolve_pair(&request.key)?;
            let bytes_total = self
                .inner
                .scanner
                .stat(&request.key, source_side)
                .await
                .ok()
                .flatten()
                .map(|m| m.size)
                .unwrap_or(0);
            items.push(JobItem {
                key: request.key,
                overwrite: request.overwrite,
                state: ItemState::Pending,
                bytes_total,
                bytes_done: 0,
                error: None,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let bytes_total = items.iter().map(|i| i.bytes_total).sum();
        let item_count = items.len();
        let job = CopyJob {
            id: id.clone(),
            kind,
            items,
            state: JobState::Queued,
            created_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
            bytes_total,
            bytes_done: 0,
            bytes_settled: 0,
            current_item_index: None,
            cancel_requested: false,
            cancel: CancellationToken::new(),
            message: None,
            last_progress_log: Instant::now(),
            last_logged_percent: 0,
        };

        {
            let mut slot = self.lock();
            if let Some(active) = &slot.current {
                return Err(SyncError::Busy(active.clone()));
            }
            slot.current = Some(id.clone());
            slot.jobs.insert(id.clone(), job);
        }

        info!(
            "任务已提交: {} ({:?}, {} 项, 共 {})",
            id,
            kind,
            item_count,
            format_size(bytes_total)
        );

        let manager = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            manager.run(job_id, observer).await;
        });

        Ok(id)
    }

    /// 获取任务快照，不会阻塞在传输上
    pub fn poll(&self, id: &str) -> SyncResult<JobSnapshot> {
        self.lock()
            .jobs
            .get(id)
            .map(CopyJob::snapshot)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// 请求取消；正在复制的项在下一个分块边界停止
    pub fn cancel(&self, id: &str) -> SyncResult<()> {
        let mut slot = self.lock();
        let job = slot
            .jobs
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if job.state.is_terminal() {
            return Err(SyncError::AlreadyTerminal(id.to_string()));
        }
        job.cancel_requested = true;
        job.cancel.cancel();
        info!("已请求取消任务: {}", id);
        Ok(())
    }

    /// 当前占用槽位的任务
    pub fn active_job(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// 客户端重连时查询仍在内存中的任务；进程重启后总是 None
    pub fn resume_if_active(&self) -> Option<String> {
        let active = self.active_job();
        if let Some(id) = &active {
            debug!("存在活动任务: {}", id);
        }
        active
    }

    /// 轮询直到任务结束
    pub async fn wait(&self, id: &str, interval: Duration) -> SyncResult<JobSnapshot> {
        loop {
            let snapshot = self.poll(id)?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn run(&self, id: String, observer: Option<ProgressObserver>) {
        // worker 异常退出时释放槽位，避免后续任务一直 Busy
        let guard = scopeguard::guard(id.clone(), |id| self.abandon(&id));

        let Some((kind, cancel, count)) = self.with_job(&id, |job| {
            job.state = JobState::Running;
            (job.kind, job.cancel.clone(), job.items.len())
        }) else {
            return;
        };
        self.notify(&id, observer.as_ref());

        let mut cancelled = false;
        let mut completed: Vec<(AssetKey, u64, bool)> = Vec::new();

        for index in 0..count {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let Some((key, overwrite)) = self.with_job(&id, |job| {
                job.current_item_index = Some(index);
                let item = &mut job.items[index];
                item.state = ItemState::Copying;
                (item.key.clone(), item.overwrite)
            }) else {
                break;
            };
            self.notify(&id, observer.as_ref());

            let outcome = self
                .process_item(&id, index, kind, &key, overwrite, &cancel, observer.as_ref())
                .await;

            self.with_job(&id, |job| match &outcome {
                Ok(ItemOutcome::Copied(bytes)) => {
                    let item = &mut job.items[index];
                    job.bytes_done = job.bytes_done - item.bytes_done + bytes;
                    item.bytes_done = *bytes;
                    item.state = ItemState::Done;
                }
                Ok(ItemOutcome::Skipped) => {
                    job.items[index].state = ItemState::Skipped;
                    job.settle_item(index, true);
                }
                Err(SyncError::Cancelled) => {
                    job.items[index].state = ItemState::Cancelled;
                    job.settle_item(index, false);
                }
                Err(e) => {
                    job.items[index].state = ItemState::Failed;
                    job.items[index].error = Some(e.clone());
                    job.settle_item(index, true);
                }
            });

            match outcome {
                Ok(ItemOutcome::Copied(bytes)) => {
                    debug!("已复制 {} ({})", key, format_size(bytes));
                    completed.push((key, bytes, overwrite));
                }
                Ok(ItemOutcome::Skipped) => debug!("大小一致，跳过 {}", key),
                Err(SyncError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => warn!("任务 {} 第 {} 项失败 {}: {}", id, index + 1, key, e),
            }
            self.notify(&id, observer.as_ref());
        }

        let (failed, skipped) = self
            .with_job(&id, |job| {
                (
                    job.items.iter().filter(|i| i.state == ItemState::Failed).count(),
                    job.items.iter().filter(|i| i.state == ItemState::Skipped).count(),
                )
            })
            .unwrap_or((0, 0));

        let state = if cancelled {
            JobState::Cancelled
        } else if failed == count {
            JobState::Error
        } else {
            JobState::Done
        };

        let mut message = match state {
            JobState::Cancelled => format!("已取消，完成 {} 项", completed.len()),
            _ => format!(
                "完成 {} 项，跳过 {} 项，失败 {} 项",
                completed.len(),
                skipped,
                failed
            ),
        };

        self.record_completed(kind, &completed).await;

        // 最后一项完成后才收到的取消同样跳过自动清理
        if kind == JobKind::Localize && state == JobState::Done && !cancel.is_cancelled() {
            if let Some(freed) = self.auto_prune().await {
                message.push_str(&format!("，自动清理释放 {}", format_size(freed)));
            }
        }

        {
            let mut slot = self.lock();
            if let Some(job) = slot.jobs.get_mut(&id) {
                job.state = state;
                job.finished_at = Some(chrono::Utc::now().timestamp_millis());
                job.current_item_index = None;
                job.message = Some(message.clone());
            }
            if slot.current.as_deref() == Some(id.as_str()) {
                slot.current = None;
            }
            slot.finished.push_back(id.clone());
            while slot.finished.len() > MAX_FINISHED_JOBS {
                if let Some(old) = slot.finished.pop_front() {
                    slot.jobs.remove(&old);
                }
            }
        }
        scopeguard::ScopeGuard::into_inner(guard);

        match state {
            JobState::Error => error!("任务 {} 失败: {}", id, message),
            _ => info!("任务 {} 结束 ({:?}): {}", id, state, message),
        }
        self.notify(&id, observer.as_ref());
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_item(
        &self,
        id: &str,
        index: usize,
        kind: JobKind,
        key: &AssetKey,
        overwrite: bool,
        cancel: &CancellationToken,
        observer: Option<&ProgressObserver>,
    ) -> SyncResult<ItemOutcome> {
        let (source_side, dest_side) = kind.sides();
        let source = self.inner.resolver.resolve(key, source_side)?;
        let destination = self.inner.resolver.resolve(key, dest_side)?;

        let source_meta = stat_file(&source)
            .await
            .map_err(|e| SyncError::copy_failed(&source, e))?
            .ok_or_else(|| SyncError::copy_failed(&source, "源文件不存在"))?;

        if !overwrite {
            if let Ok(Some(existing)) = stat_file(&destination).await {
                if existing.size == source_meta.size {
                    return Ok(ItemOutcome::Skipped);
                }
            }
        }

        let bytes = self
            .inner
            .engine
            .copy(
                &source,
                &destination,
                overwrite,
                id,
                |copied| self.record_progress(id, index, copied, observer),
                cancel,
            )
            .await?;
        Ok(ItemOutcome::Copied(bytes))
    }

    fn record_progress(
        &self,
        id: &str,
        index: usize,
        copied: u64,
        observer: Option<&ProgressObserver>,
    ) {
        let snapshot = {
            let mut slot = self.lock();
            let Some(job) = slot.jobs.get_mut(id) else {
                return;
            };
            let item = &mut job.items[index];
            let previous = item.bytes_done;
            item.bytes_done = copied;
            job.bytes_done = job.bytes_done - previous + copied;

            let percent = job.percent() as u32;
            if job.last_progress_log.elapsed() >= PROGRESS_LOG_INTERVAL
                && percent != job.last_logged_percent
            {
                info!(
                    "任务 {} 进度 {}% ({}/{})",
                    id,
                    percent,
                    format_size(job.bytes_done),
                    format_size(job.bytes_total)
                );
                job.last_progress_log = Instant::now();
                job.last_logged_percent = percent;
            }

            observer.map(|_| job.snapshot())
        };

        if let (Some(observer), Some(snapshot)) = (observer, snapshot) {
            observer(&snapshot);
        }
    }

    fn notify(&self, id: &str, observer: Option<&ProgressObserver>) {
        let Some(observer) = observer else {
            return;
        };
        if let Some(snapshot) = self.with_job(id, |job| job.snapshot()) {
            observer(&snapshot);
        }
    }

    /// 记录使用次数并写入操作日志
    async fn record_completed(&self, kind: JobKind, completed: &[(AssetKey, u64, bool)]) {
        if completed.is_empty() {
            return;
        }
        let keys: Vec<AssetKey> = completed.iter().map(|(k, _, _)| k.clone()).collect();
        if let Err(e) = self.inner.usage.touch(&keys, UsageKind::Transfer).await {
            warn!("更新使用记录失败: {}", e);
        }

        let timestamp = chrono::Utc::now().timestamp_millis();
        let entries: Vec<ActionEntry> = completed
            .iter()
            .map(|(key, bytes, overwrite)| match kind {
                JobKind::Localize => ActionEntry::Localize {
                    timestamp,
                    key: key.clone(),
                    bytes: *bytes,
                    overwrite: *overwrite,
                },
                JobKind::Upload => ActionEntry::Upload {
                    timestamp,
                    key: key.clone(),
                    bytes: *bytes,
                    overwrite: *overwrite,
                },
            })
            .collect();
        if let Err(e) = self.inner.log.append_all(&entries).await {
            warn!("写入操作日志失败: {}", e);
        }
    }

    /// 本地化完成后的自动清理，返回释放的字节数
    async fn auto_prune(&self) -> Option<u64> {
        let settings = self.settings();
        if !settings.auto_delete_enabled || settings.max_cache_bytes == 0 {
            return None;
        }
        match self.inner.pruner.prune(&settings, PruneTrigger::Auto).await {
            Ok(report) if report.bytes_freed > 0 => Some(report.bytes_freed),
            Ok(_) => None,
            Err(e) => {
                warn!("自动清理失败: {}", e);
                None
            }
        }
    }

    fn abandon(&self, id: &str) {
        let mut slot = self.lock();
        if slot.current.as_deref() != Some(id) {
            return;
        }
        slot.current = None;
        if let Some(job) = slot.jobs.get_mut(id) {
            job.state = JobState::Error;
            job.finished_at = Some(chrono::Utc::now().timestamp_millis());
            job.current_item_index = None;
            job.message = Some("任务异常终止".to_string());
        }
        slot.finished.push_back(id.to_string());
        error!("任务 {} 异常终止", id);
    }
}
