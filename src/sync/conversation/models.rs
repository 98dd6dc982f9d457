//! 会话本地模型定义

use serde::Serialize;
use uuid::Uuid;

/// 消息角色
///
/// 上传时决定说话人归属：assistant/system 设置当前问题，user 关闭问答对；
/// error 是 UI 层的提示消息，从不参与配对。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Error,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Error => "error",
        }
    }

    /// 从数据库文本还原角色，未知取值归入 error（不会参与配对）
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::Error,
        }
    }
}

/// 本地会话记录
///
/// `local_id` 在创建时生成、不可变，是本地身份的主键；
/// `remote_id` 只在上传成功后出现——它为 None 表示这台设备从未确认过
/// 服务端持久化，一旦有值就绝不重复上传。
///
/// 序列化字段名与设备端展示层的 JSON 键一致，宿主拿到即可直接渲染。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalConversation {
    #[serde(rename = "localID")]
    pub local_id: String,

    #[serde(rename = "remoteID")]
    pub remote_id: Option<i64>,

    #[serde(rename = "ownerEmail")]
    pub owner_email: String,

    pub topic: String,

    /// 创建时间（unix 毫秒），历史列表按它降序排列
    #[serde(rename = "startDate")]
    pub start_date: i64,

    #[serde(rename = "isComplete")]
    pub is_complete: bool,

    // —— 以下为打分载荷，同步逻辑原样携带、从不解释 ——
    #[serde(rename = "finalFeedback")]
    pub final_feedback: Option<String>,

    #[serde(rename = "fluencyScore")]
    pub fluency_score: i32,

    #[serde(rename = "vocabularyScore")]
    pub vocabulary_score: i32,

    #[serde(rename = "grammarScore")]
    pub grammar_score: i32,

    #[serde(rename = "pronunciationScore")]
    pub pronunciation_score: i32,

    #[serde(rename = "overallBandScore")]
    pub overall_band_score: f64,
}

impl LocalConversation {
    /// 创建新的本地会话（未完成、未同步、无打分）
    pub fn new(owner_email: impl Into<String>, topic: impl Into<String>, start_date: i64) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            remote_id: None,
            owner_email: owner_email.into(),
            topic: topic.into(),
            start_date,
            is_complete: false,
            final_feedback: None,
            fluency_score: 0,
            vocabulary_score: 0,
            grammar_score: 0,
            pronunciation_score: 0,
            overall_band_score: 0.0,
        }
    }
}

/// 本地消息记录
///
/// 只随所属会话存在，删除会话时级联删除。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMessage {
    #[serde(rename = "messageID")]
    pub message_id: String,

    #[serde(rename = "conversationLocalID")]
    pub conversation_local_id: String,

    pub content: String,

    pub role: MessageRole,

    /// 发送时间（unix 毫秒），既是排序键也是问答配对的时间轴
    pub timestamp: i64,
}

impl LocalMessage {
    pub fn new(
        conversation_local_id: impl Into<String>,
        content: impl Into<String>,
        role: MessageRole,
        timestamp: i64,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_local_id: conversation_local_id.into(),
            content: content.into(),
            role,
            timestamp,
        }
    }
}

/// 同步引擎配置
pub struct SyncEngineConfig {
    /// 当前登录用户邮箱，所有本地查询都用它做归属过滤
    pub owner_email: String,
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// 本地 SQLite 数据库 URL，例如 `sqlite://ielts_history.db?mode=rwc`
    pub db_path: String,
}
