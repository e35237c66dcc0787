//! 复制任务命令

use crate::core::{AssetKey, JobKind, JobRequest, JobSnapshot, SyncError, SyncResult};
use crate::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
}

/// 解析任务类型
pub fn parse_job_kind(kind: &str) -> SyncResult<JobKind> {
    match kind {
        "localize" => Ok(JobKind::Localize),
        "upload" => Ok(JobKind::Upload),
        _ => Err(SyncError::InvalidRequest(format!("无效的任务类型: {}", kind))),
    }
}

/// 提交任务；已有任务运行时返回 `busy`，不会排队
pub async fn start_job(
    state: &AppState,
    kind: JobKind,
    keys: Vec<AssetKey>,
    overwrite: bool,
) -> SyncResult<StartJobResponse> {
    let requests = keys
        .into_iter()
        .map(|key| JobRequest::new(key, overwrite))
        .collect();
    let job_id = state.jobs.start(kind, requests).await?;
    Ok(StartJobResponse { job_id })
}

pub fn poll_job(state: &AppState, job_id: &str) -> SyncResult<JobSnapshot> {
    state.jobs.poll(job_id)
}

pub fn cancel_job(state: &AppState, job_id: &str) -> SyncResult<()> {
    state.jobs.cancel(job_id)
}

/// 当前活动任务（客户端重连时使用）
pub fn active_job(state: &AppState) -> Option<String> {
    state.jobs.resume_if_active()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_kind() {
        assert_eq!(parse_job_kind("localize").unwrap(), JobKind::Localize);
        assert_eq!(parse_job_kind("upload").unwrap(), JobKind::Upload);
        assert!(matches!(
            parse_job_kind("sync"),
            Err(SyncError::InvalidRequest(_))
        ));
    }
}
