//! 会话数据访问层（DAO）
//!
//! 负责所有会话/消息/墓碑相关的数据库操作，把数据访问逻辑与同步逻辑分离。
//! 所有查询都是 sqlx 原生 SQL；暂时性失败（SQLITE_BUSY 等）在这一层
//! 做最多 3 次线性退避重试，重试耗尽后作为 `StoreTransient` 上抛。

use crate::sync::conversation::models::{LocalConversation, LocalMessage, MessageRole};
use crate::sync::types::SyncError;
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 存储操作最大尝试次数
const STORE_MAX_ATTEMPTS: u32 = 3;

/// 线性退避步长
const STORE_RETRY_STEP: Duration = Duration::from_millis(50);

/// 对暂时性存储错误做线性退避重试
///
/// 只重试 `StoreTransient`，其余错误原样上抛。
async fn with_store_retry<T, F, Fut>(op_name: &str, mut f: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Err(SyncError::StoreTransient(msg)) if attempt < STORE_MAX_ATTEMPTS => {
                warn!(
                    "[ConvDAO] 存储忙，{} 第 {} 次重试: {}",
                    op_name, attempt, msg
                );
                tokio::time::sleep(STORE_RETRY_STEP * attempt).await;
            }
            other => return other,
        }
    }
}

fn row_to_conversation(row: &SqliteRow) -> LocalConversation {
    let is_complete: i64 = row.get("is_complete");
    LocalConversation {
        local_id: row.get("local_id"),
        remote_id: row.get("remote_id"),
        owner_email: row.get("owner_email"),
        topic: row.get("topic"),
        start_date: row.get("start_date"),
        is_complete: is_complete != 0,
        final_feedback: row.get("final_feedback"),
        fluency_score: row.get("fluency_score"),
        vocabulary_score: row.get("vocabulary_score"),
        grammar_score: row.get("grammar_score"),
        pronunciation_score: row.get("pronunciation_score"),
        overall_band_score: row.get("overall_band_score"),
    }
}

fn row_to_message(row: &SqliteRow) -> LocalMessage {
    let role: String = row.get("role");
    LocalMessage {
        message_id: row.get("message_id"),
        conversation_local_id: row.get("conversation_local_id"),
        content: row.get("content"),
        role: MessageRole::parse(&role),
        timestamp: row.get("timestamp"),
    }
}

/// 会话 DAO
pub struct ConversationDao {
    db: Pool<Sqlite>,
}

impl ConversationDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 初始化数据库表结构
    pub async fn init_db(&self) -> Result<(), SyncError> {
        Self::init_db_with_connection(&self.db).await
    }

    /// 使用共享连接初始化数据库表结构（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<(), SyncError> {
        info!("[ConvDAO/DB] 初始化会话数据库表结构");

        let sql1 = r#"
            CREATE TABLE IF NOT EXISTS local_conversations (
                local_id TEXT PRIMARY KEY,
                remote_id INTEGER,
                owner_email TEXT NOT NULL DEFAULT '',
                topic TEXT NOT NULL DEFAULT '',
                start_date INTEGER NOT NULL DEFAULT 0,
                is_complete INTEGER NOT NULL DEFAULT 0,
                final_feedback TEXT,
                fluency_score INTEGER NOT NULL DEFAULT 0,
                vocabulary_score INTEGER NOT NULL DEFAULT 0,
                grammar_score INTEGER NOT NULL DEFAULT 0,
                pronunciation_score INTEGER NOT NULL DEFAULT 0,
                overall_band_score REAL NOT NULL DEFAULT 0.0
            )
        "#;
        sqlx::query(sql1).execute(db).await.map_err(SyncError::store)?;

        let sql2 = r#"
            CREATE TABLE IF NOT EXISTS local_messages (
                message_id TEXT PRIMARY KEY,
                conversation_local_id TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'user',
                timestamp INTEGER NOT NULL DEFAULT 0
            )
        "#;
        sqlx::query(sql2).execute(db).await.map_err(SyncError::store)?;

        let sql3 = r#"
            CREATE TABLE IF NOT EXISTS local_kv (
                namespace TEXT PRIMARY KEY,
                value TEXT NOT NULL DEFAULT ''
            )
        "#;
        sqlx::query(sql3).execute(db).await.map_err(SyncError::store)?;

        // remote_id 是下载物化的存在性检查键，owner_email 是所有查询的过滤键
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_remote_id ON local_conversations (remote_id)",
        )
        .execute(db)
        .await
        .map_err(SyncError::store)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_owner ON local_conversations (owner_email)",
        )
        .execute(db)
        .await
        .map_err(SyncError::store)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON local_messages (conversation_local_id)",
        )
        .execute(db)
        .await
        .map_err(SyncError::store)?;

        info!("[ConvDAO/DB] 数据库表初始化完成");
        Ok(())
    }

    /// 查询指定用户未同步且已完成的会话 ID（上传候选）
    pub async fn find_unsynced_completed(&self, owner: &str) -> Result<Vec<String>, SyncError> {
        with_store_retry("查询未同步会话", || async move {
            let rows = sqlx::query(
                r#"
                SELECT local_id FROM local_conversations
                WHERE remote_id IS NULL AND is_complete = 1 AND owner_email = ?
                ORDER BY start_date ASC
                "#,
            )
            .bind(owner)
            .fetch_all(&self.db)
            .await
            .map_err(SyncError::store)?;

            Ok(rows
                .into_iter()
                .map(|row| row.get::<String, _>("local_id"))
                .collect())
        })
        .await
    }

    /// 按本地 ID 查询单个会话
    pub async fn get_conversation(
        &self,
        local_id: &str,
    ) -> Result<Option<LocalConversation>, SyncError> {
        with_store_retry("查询会话", || async move {
            let row = sqlx::query("SELECT * FROM local_conversations WHERE local_id = ?")
                .bind(local_id)
                .fetch_optional(&self.db)
                .await
                .map_err(SyncError::store)?;
            Ok(row.map(|r| row_to_conversation(&r)))
        })
        .await
    }

    /// 按远端 ID 查询会话（下载物化前的存在性检查）
    pub async fn get_conversation_by_remote_id(
        &self,
        remote_id: i64,
    ) -> Result<Option<LocalConversation>, SyncError> {
        with_store_retry("按远端ID查询会话", || async move {
            let row = sqlx::query("SELECT * FROM local_conversations WHERE remote_id = ? LIMIT 1")
                .bind(remote_id)
                .fetch_optional(&self.db)
                .await
                .map_err(SyncError::store)?;
            Ok(row.map(|r| row_to_conversation(&r)))
        })
        .await
    }

    /// 查询指定用户的全部会话，按开始时间降序（历史列表）
    pub async fn get_conversations_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<LocalConversation>, SyncError> {
        with_store_retry("查询历史会话", || async move {
            let rows = sqlx::query(
                r#"
                SELECT * FROM local_conversations
                WHERE owner_email = ?
                ORDER BY start_date DESC
                "#,
            )
            .bind(owner)
            .fetch_all(&self.db)
            .await
            .map_err(SyncError::store)?;
            Ok(rows.iter().map(row_to_conversation).collect())
        })
        .await
    }

    /// 查询会话的消息，按时间升序（配对的时间轴）
    pub async fn get_messages(&self, local_id: &str) -> Result<Vec<LocalMessage>, SyncError> {
        with_store_retry("查询会话消息", || async move {
            let rows = sqlx::query(
                r#"
                SELECT * FROM local_messages
                WHERE conversation_local_id = ?
                ORDER BY timestamp ASC
                "#,
            )
            .bind(local_id)
            .fetch_all(&self.db)
            .await
            .map_err(SyncError::store)?;
            Ok(rows.iter().map(row_to_message).collect())
        })
        .await
    }

    /// 插入会话
    pub async fn insert_conversation(&self, conv: &LocalConversation) -> Result<(), SyncError> {
        with_store_retry("插入会话", || async move {
            Self::insert_conversation_exec(&self.db, conv).await
        })
        .await
    }

    async fn insert_conversation_exec<'e, E>(executor: E, conv: &LocalConversation) -> Result<(), SyncError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO local_conversations (
                local_id, remote_id, owner_email, topic, start_date, is_complete,
                final_feedback, fluency_score, vocabulary_score, grammar_score,
                pronunciation_score, overall_band_score
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&conv.local_id)
        .bind(conv.remote_id)
        .bind(&conv.owner_email)
        .bind(&conv.topic)
        .bind(conv.start_date)
        .bind(if conv.is_complete { 1 } else { 0 })
        .bind(&conv.final_feedback)
        .bind(conv.fluency_score)
        .bind(conv.vocabulary_score)
        .bind(conv.grammar_score)
        .bind(conv.pronunciation_score)
        .bind(conv.overall_band_score)
        .execute(executor)
        .await
        .map_err(SyncError::store)?;
        Ok(())
    }

    /// 插入消息
    pub async fn insert_message(&self, msg: &LocalMessage) -> Result<(), SyncError> {
        with_store_retry("插入消息", || async move {
            Self::insert_message_exec(&self.db, msg).await
        })
        .await
    }

    async fn insert_message_exec<'e, E>(executor: E, msg: &LocalMessage) -> Result<(), SyncError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO local_messages (message_id, conversation_local_id, content, role, timestamp)
            VALUES (?,?,?,?,?)
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.conversation_local_id)
        .bind(&msg.content)
        .bind(msg.role.as_str())
        .bind(msg.timestamp)
        .execute(executor)
        .await
        .map_err(SyncError::store)?;
        Ok(())
    }

    /// 在单个事务里批量插入物化会话及其消息
    ///
    /// 下载合并在结尾一次性提交，崩溃时不会留下半合并状态。
    pub async fn insert_materialized(
        &self,
        batch: &[(LocalConversation, Vec<LocalMessage>)],
    ) -> Result<(), SyncError> {
        with_store_retry("批量插入物化会话", || async move {
            let mut tx = self.db.begin().await.map_err(SyncError::store)?;
            for (conv, messages) in batch {
                Self::insert_conversation_exec(&mut *tx, conv).await?;
                for msg in messages {
                    Self::insert_message_exec(&mut *tx, msg).await?;
                }
            }
            tx.commit().await.map_err(SyncError::store)?;
            Ok(())
        })
        .await
    }

    /// 上传成功后回写服务端分配的 ID
    pub async fn set_remote_id(&self, local_id: &str, remote_id: i64) -> Result<(), SyncError> {
        with_store_retry("回写远端ID", || async move {
            sqlx::query("UPDATE local_conversations SET remote_id = ? WHERE local_id = ?")
                .bind(remote_id)
                .bind(local_id)
                .execute(&self.db)
                .await
                .map_err(SyncError::store)?;
            Ok(())
        })
        .await
    }

    /// 用户重命名话题（与同步状态无关）
    pub async fn set_topic(&self, local_id: &str, topic: &str) -> Result<(), SyncError> {
        with_store_retry("重命名会话", || async move {
            sqlx::query("UPDATE local_conversations SET topic = ? WHERE local_id = ?")
                .bind(topic)
                .bind(local_id)
                .execute(&self.db)
                .await
                .map_err(SyncError::store)?;
            Ok(())
        })
        .await
    }

    /// 删除会话及其全部消息（级联，单事务）
    pub async fn delete_conversation(&self, local_id: &str) -> Result<(), SyncError> {
        with_store_retry("删除会话", || async move {
            let mut tx = self.db.begin().await.map_err(SyncError::store)?;
            sqlx::query("DELETE FROM local_messages WHERE conversation_local_id = ?")
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::store)?;
            sqlx::query("DELETE FROM local_conversations WHERE local_id = ?")
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(SyncError::store)?;
            tx.commit().await.map_err(SyncError::store)?;
            Ok(())
        })
        .await
    }
}

/// 墓碑固定命名空间
const TOMBSTONE_NAMESPACE: &str = "deleted_remote_ids";

/// 删除墓碑 DAO
///
/// 持久化一组已在本地删除的远端 ID，整集合读-改-写，独立于会话表存在
/// （会话行删掉之后墓碑仍然有效）。一旦某个远端 ID 进了墓碑，后续下载
/// 绝不允许再物化它。
pub struct TombstoneDao {
    db: Pool<Sqlite>,
}

impl TombstoneDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 读取整个墓碑集合
    pub async fn all(&self) -> Result<BTreeSet<i64>, SyncError> {
        with_store_retry("读取墓碑集合", || async move { self.load_set().await }).await
    }

    async fn load_set(&self) -> Result<BTreeSet<i64>, SyncError> {
        let row = sqlx::query("SELECT value FROM local_kv WHERE namespace = ?")
            .bind(TOMBSTONE_NAMESPACE)
            .fetch_optional(&self.db)
            .await
            .map_err(SyncError::store)?;

        let Some(row) = row else {
            return Ok(BTreeSet::new());
        };

        let raw: String = row.get("value");
        match serde_json::from_str::<Vec<i64>>(&raw) {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(e) => {
                // 集合损坏时宁可当空集也不阻塞同步；后续写入会覆盖掉坏数据
                warn!("[Tombstone] 墓碑集合解析失败，按空集处理: {}", e);
                Ok(BTreeSet::new())
            }
        }
    }

    async fn save_set(&self, set: &BTreeSet<i64>) -> Result<(), SyncError> {
        let value = serde_json::to_string(&set.iter().collect::<Vec<_>>())
            .map_err(|e| SyncError::StoreFatal(format!("序列化墓碑集合失败: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO local_kv (namespace, value) VALUES (?, ?)
            ON CONFLICT(namespace) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(TOMBSTONE_NAMESPACE)
        .bind(value)
        .execute(&self.db)
        .await
        .map_err(SyncError::store)?;
        Ok(())
    }

    /// 把远端 ID 加入墓碑
    pub async fn add(&self, remote_id: i64) -> Result<(), SyncError> {
        with_store_retry("写入墓碑", || async move {
            let mut set = self.load_set().await?;
            if set.insert(remote_id) {
                debug!("[Tombstone] 标记远端会话已删除: {}", remote_id);
                self.save_set(&set).await?;
            }
            Ok(())
        })
        .await
    }

    /// 墓碑成员检查——必须发生在任何物化决策之前
    pub async fn contains(&self, remote_id: i64) -> Result<bool, SyncError> {
        with_store_retry("查询墓碑", || async move {
            Ok(self.load_set().await?.contains(&remote_id))
        })
        .await
    }

    /// 把远端 ID 移出墓碑（常规流程不会走到，留给显式恢复）
    pub async fn remove(&self, remote_id: i64) -> Result<(), SyncError> {
        with_store_retry("移除墓碑", || async move {
            let mut set = self.load_set().await?;
            if set.remove(&remote_id) {
                debug!("[Tombstone] 解除远端会话删除标记: {}", remote_id);
                self.save_set(&set).await?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::db::create_sqlite_pool;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn mem_dao() -> ConversationDao {
        let pool = create_sqlite_pool("sqlite::memory:").await.unwrap();
        let dao = ConversationDao::new(pool);
        dao.init_db().await.unwrap();
        dao
    }

    fn complete_conv(owner: &str, topic: &str, start: i64) -> LocalConversation {
        let mut conv = LocalConversation::new(owner, topic, start);
        conv.is_complete = true;
        conv
    }

    #[tokio::test]
    async fn test_find_unsynced_completed_scopes_by_owner_and_state() {
        let dao = mem_dao().await;

        let pending = complete_conv("a@x.com", "Daily Life", 1);
        let incomplete = LocalConversation::new("a@x.com", "Work", 2);
        let mut synced = complete_conv("a@x.com", "Travel", 3);
        synced.remote_id = Some(9);
        let other_owner = complete_conv("b@x.com", "Hobbies", 4);

        for conv in [&pending, &incomplete, &synced, &other_owner] {
            dao.insert_conversation(conv).await.unwrap();
        }

        let ids = dao.find_unsynced_completed("a@x.com").await.unwrap();
        assert_eq!(ids, vec![pending.local_id.clone()]);
    }

    #[tokio::test]
    async fn test_set_remote_id_enables_lookup() {
        let dao = mem_dao().await;
        let conv = complete_conv("a@x.com", "Daily Life", 1);
        dao.insert_conversation(&conv).await.unwrap();

        assert!(dao.get_conversation_by_remote_id(42).await.unwrap().is_none());
        dao.set_remote_id(&conv.local_id, 42).await.unwrap();

        let found = dao.get_conversation_by_remote_id(42).await.unwrap().unwrap();
        assert_eq!(found.local_id, conv.local_id);
        assert_eq!(found.remote_id, Some(42));
        // 回写后不再是上传候选
        assert!(dao.find_unsynced_completed("a@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades_messages() {
        let dao = mem_dao().await;
        let conv = complete_conv("a@x.com", "Daily Life", 1);
        dao.insert_conversation(&conv).await.unwrap();
        dao.insert_message(&LocalMessage::new(&conv.local_id, "Q1", MessageRole::Assistant, 1))
            .await
            .unwrap();
        dao.insert_message(&LocalMessage::new(&conv.local_id, "A1", MessageRole::User, 2))
            .await
            .unwrap();

        dao.delete_conversation(&conv.local_id).await.unwrap();
        assert!(dao.get_conversation(&conv.local_id).await.unwrap().is_none());
        assert!(dao.get_messages(&conv.local_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_sorted_newest_first() {
        let dao = mem_dao().await;
        let older = complete_conv("a@x.com", "Old", 100);
        let newer = complete_conv("a@x.com", "New", 200);
        dao.insert_conversation(&older).await.unwrap();
        dao.insert_conversation(&newer).await.unwrap();

        let history = dao.get_conversations_by_owner("a@x.com").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].topic, "New");
        assert_eq!(history[1].topic, "Old");
    }

    #[tokio::test]
    async fn test_tombstone_set_survives_row_deletion() {
        let pool = create_sqlite_pool("sqlite::memory:").await.unwrap();
        let dao = ConversationDao::new(pool.clone());
        dao.init_db().await.unwrap();
        let tombstones = TombstoneDao::new(pool);

        let mut conv = complete_conv("a@x.com", "Daily Life", 1);
        conv.remote_id = Some(7);
        dao.insert_conversation(&conv).await.unwrap();

        tombstones.add(7).await.unwrap();
        dao.delete_conversation(&conv.local_id).await.unwrap();

        // 会话行没了，墓碑还在
        assert!(tombstones.contains(7).await.unwrap());
        assert!(!tombstones.contains(8).await.unwrap());

        tombstones.remove(7).await.unwrap();
        assert!(!tombstones.contains(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_retry_recovers_from_transient_failures() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        // 前两次 SQLITE_BUSY，第三次成功
        let result = with_store_retry("测试操作", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::StoreTransient("database is locked".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_retry_exhaustion_surfaces_transient_error() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: Result<(), SyncError> = with_store_retry("测试操作", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::StoreTransient("database is locked".to_string()))
        })
        .await;

        assert!(matches!(result, Err(SyncError::StoreTransient(_))));
        assert_eq!(counter.load(Ordering::SeqCst), STORE_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_store_retry_does_not_retry_fatal_errors() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: Result<(), SyncError> = with_store_retry("测试操作", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::StoreFatal("UNIQUE constraint failed".to_string()))
        })
        .await;

        assert!(matches!(result, Err(SyncError::StoreFatal(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tombstone_add_is_idempotent() {
        let pool = create_sqlite_pool("sqlite::memory:").await.unwrap();
        ConversationDao::init_db_with_connection(&pool).await.unwrap();
        let tombstones = TombstoneDao::new(pool);

        tombstones.add(7).await.unwrap();
        tombstones.add(7).await.unwrap();
        assert_eq!(tombstones.all().await.unwrap().len(), 1);
    }
}
