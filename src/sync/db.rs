//! SQLite 数据库工具：统一创建连接池
//!
//! 持久层遵循单写者约定：连接池上限为 1，所有读写串行经过同一个连接，
//! 避免 SQLite 多写者冲突。表结构由各 DAO 的 `init_db` 负责创建。

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

/// 创建 SQLite 连接池
///
/// `db_url` 形如 `sqlite://ielts_history.db?mode=rwc`，
/// 单元测试可传 `sqlite::memory:`。
pub async fn create_sqlite_pool(db_url: &str) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .context(format!("连接SQLite数据库失败: {}", db_url))?;

    Ok(pool)
}
