//! 使用记录管理 - 为缓存淘汰提供最近使用时间和使用次数

use crate::core::resolver::AssetKey;
use crate::db::{UsageKind, UsageRecord, UsageRecordRow};
use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 使用记录管理器
#[derive(Debug, Clone)]
pub struct UsageStore {
    db: Arc<SqlitePool>,
}

impl UsageStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 以当前时间记录一次使用
    pub async fn touch(&self, keys: &[AssetKey], kind: UsageKind) -> Result<()> {
        self.touch_at(keys, kind, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// 以指定时间（毫秒）记录一次使用
    pub async fn touch_at(&self, keys: &[AssetKey], kind: UsageKind, at: i64) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let (access, transfer) = match kind {
            UsageKind::Access => (1i64, 0i64),
            UsageKind::Transfer => (0, 1),
        };

        let mut tx = self.db.begin().await?;
        for key in keys {
            sqlx::query(
                r#"INSERT INTO usage_records
                   (asset_key, category, relative_path, last_used_at, use_count, access_count, transfer_count)
                   VALUES (?, ?, ?, ?, 1, ?, ?)
                   ON CONFLICT(asset_key) DO UPDATE SET
                       last_used_at = max(usage_records.last_used_at, excluded.last_used_at),
                       use_count = usage_records.use_count + 1,
                       access_count = usage_records.access_count + excluded.access_count,
                       transfer_count = usage_records.transfer_count + excluded.transfer_count"#,
            )
            .bind(key.to_string())
            .bind(&key.category)
            .bind(&key.relative_path)
            .bind(at)
            .bind(access)
            .bind(transfer)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("记录 {} 个资源的使用 ({:?})", keys.len(), kind);
        Ok(())
    }

    /// 所有使用记录，按 `category/relative_path` 索引
    pub async fn snapshot(&self) -> Result<HashMap<AssetKey, UsageRecord>> {
        let rows = sqlx::query_as::<_, UsageRecordRow>("SELECT * FROM usage_records")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(UsageRecord::from)
            .map(|r| (r.key.clone(), r))
            .collect())
    }

    pub async fn get(&self, key: &AssetKey) -> Result<Option<UsageRecord>> {
        let row =
            sqlx::query_as::<_, UsageRecordRow>("SELECT * FROM usage_records WHERE asset_key = ?")
                .bind(key.to_string())
                .fetch_optional(&*self.db)
                .await?;
        Ok(row.map(UsageRecord::from))
    }

    /// 文件被删除后移除其使用记录
    pub async fn remove(&self, key: &AssetKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM usage_records WHERE asset_key = ?")
            .bind(key.to_string())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, UsageStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::db::connect(dir.path()).await.unwrap();
        (dir, UsageStore::new(Arc::new(db)))
    }

    #[tokio::test]
    async fn test_touch_accumulates() {
        let (_dir, store) = store().await;
        let key = AssetKey::new("checkpoints", "a.pt").unwrap();

        store.touch_at(&[key.clone()], UsageKind::Access, 1_000).await.unwrap();
        store.touch_at(&[key.clone()], UsageKind::Transfer, 5_000).await.unwrap();
        // 更早的时间不会回退 last_used_at
        store.touch_at(&[key.clone()], UsageKind::Access, 2_000).await.unwrap();

        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.use_count, 3);
        assert_eq!(record.access_count, 2);
        assert_eq!(record.transfer_count, 1);
        assert_eq!(record.last_used_at, 5_000);
    }

    #[tokio::test]
    async fn test_remove() {
        let (_dir, store) = store().await;
        let key = AssetKey::new("loras", "x/y.safetensors").unwrap();
        store.touch(&[key.clone()], UsageKind::Access).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot[&key].key, key);

        assert!(store.remove(&key).await.unwrap());
        assert!(!store.remove(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
