pub mod models;
pub use models::*;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
pub use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// 打开（或创建）数据目录下的数据库并执行迁移
pub async fn connect(data_dir: &Path) -> Result<SqlitePool> {
    let db_path = data_dir.join("modelsync.db");
    // SQLite 连接字符串格式: sqlite:path，Windows 路径需要转换反斜杠
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
        .replace('\\', "/");

    let db = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
        .await?;

    sqlx::migrate!("./migrations").run(&db).await?;

    tracing::debug!("数据库已就绪: {:?}", db_path);
    Ok(db)
}
