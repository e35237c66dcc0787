use crate::core::resolver::AssetKey;
use serde::{Deserialize, Serialize};

/// 使用来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// 宿主程序读取 / 引用了该资源
    Access,
    /// 本地化或上传完成
    Transfer,
}

/// 资源使用记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub key: AssetKey,
    /// 最近使用时间（毫秒时间戳）
    pub last_used_at: i64,
    pub use_count: u64,
    pub access_count: u64,
    pub transfer_count: u64,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageRecordRow {
    pub asset_key: String,
    pub category: String,
    pub relative_path: String,
    pub last_used_at: i64,
    pub use_count: i64,
    pub access_count: i64,
    pub transfer_count: i64,
}

impl From<UsageRecordRow> for UsageRecord {
    fn from(row: UsageRecordRow) -> Self {
        UsageRecord {
            key: AssetKey {
                category: row.category,
                relative_path: row.relative_path,
            },
            last_used_at: row.last_used_at,
            use_count: row.use_count.max(0) as u64,
            access_count: row.access_count.max(0) as u64,
            transfer_count: row.transfer_count.max(0) as u64,
        }
    }
}
