//! 日志相关命令

use crate::core::{SyncError, SyncResult};
use crate::logging::LogConfig;
use crate::AppState;

/// 获取日志配置
pub fn get_log_config(state: &AppState) -> LogConfig {
    LogConfig::load(&state.config_dir)
}

/// 设置日志配置，下次启动时生效
pub fn set_log_config(
    state: &AppState,
    enabled: Option<bool>,
    max_size_mb: Option<u32>,
    level: Option<&str>,
) -> SyncResult<LogConfig> {
    let mut config = LogConfig::load(&state.config_dir);
    config
        .apply(enabled, max_size_mb, level)
        .map_err(SyncError::InvalidRequest)?;

    config
        .save(&state.config_dir)
        .map_err(|e| SyncError::Config(e.to_string()))?;

    Ok(config)
}
