//! 同步引擎公共类型：错误分类与服务端 DTO

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 同步错误分类
///
/// 只有 `Unauthorized` 会中止整个同步周期（token 都没有，后续请求不可能成功）；
/// 其余错误都是单条级别的：记录日志、跳过该条，等待下一个同步周期重试。
#[derive(Debug, Error)]
pub enum SyncError {
    /// 缺少或无效的认证 token
    #[error("未认证或 token 无效")]
    Unauthorized,
    /// 网络传输失败（连接失败、超时、非 2xx 状态码等）
    #[error("网络传输失败: {0}")]
    Transport(String),
    /// 服务端返回的数据无法解析
    #[error("响应解析失败: {0}")]
    Decode(String),
    /// 本地存储暂时不可用（SQLITE_BUSY / 连接池超时），重试后可能成功
    #[error("本地存储暂时不可用: {0}")]
    StoreTransient(String),
    /// 本地存储不可恢复的错误
    #[error("本地存储错误: {0}")]
    StoreFatal(String),
}

impl SyncError {
    /// 把 sqlx 错误归类为暂时性 / 致命性存储错误
    pub(crate) fn store(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::StoreTransient(e.to_string()),
            sqlx::Error::Database(db) => {
                let msg = db.message().to_lowercase();
                if msg.contains("locked") || msg.contains("busy") {
                    Self::StoreTransient(e.to_string())
                } else {
                    Self::StoreFatal(e.to_string())
                }
            }
            _ => Self::StoreFatal(e.to_string()),
        }
    }

    /// 把 reqwest 错误归类为传输 / 解析错误
    pub(crate) fn http(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// 服务端的问答对 DTO
///
/// `question` / `answer` 是同步逻辑真正关心的字段，其余都是可选的打分元数据，
/// 原样透传，不参与合并决策。可选键在 JSON 里是 camelCase。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswerPair {
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<i32>,
}

impl QuestionAnswerPair {
    /// 创建只有问题和回答的问答对（元数据全部为空）
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            part: None,
            topic: None,
            answer_length: None,
            response_time: None,
            sentence_count: None,
            question_complexity: None,
            answer_index: None,
            total_questions: None,
        }
    }
}

/// 服务端的会话 DTO（下载响应的单项 / 上传响应体）
///
/// `created_at` 在 JSON 里就是 snake_case，不做重命名。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: i64,
    pub created_at: String,
    #[serde(default)]
    pub conversation: Vec<QuestionAnswerPair>,
}

/// 上传请求体
#[derive(Debug, Clone, Serialize)]
pub struct ConversationPayload {
    pub conversation: Vec<QuestionAnswerPair>,
}

/// 服务端错误响应体
#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
}

/// 登录响应（POST /token）
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}
