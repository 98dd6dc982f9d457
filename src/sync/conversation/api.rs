//! 会话远端接口
//!
//! `ConversationBackend` 是同步引擎对服务端的唯一出口；`ConversationApi`
//! 是它的 HTTP 实现。token 每次请求时从 `TokenProvider` 现取，取不到
//! 直接判 `Unauthorized`，不发请求。

use crate::sync::auth::TokenProvider;
use crate::sync::types::{ConversationPayload, ErrorDetail, RemoteConversation, SyncError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 会话远端接口（上传 / 下载 / 删除）
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// 拉取当前用户的全部远端会话（单次全量，不分页）
    async fn fetch_conversations(&self) -> Result<Vec<RemoteConversation>, SyncError>;

    /// 上传一条会话，返回带服务端 ID 的记录
    async fn save_conversation(
        &self,
        payload: &ConversationPayload,
    ) -> Result<RemoteConversation, SyncError>;

    /// 删除远端会话（尽力而为，调用方已先写墓碑）
    async fn delete_conversation(&self, remote_id: i64) -> Result<(), SyncError>;
}

/// 会话 HTTP API 客户端
pub struct ConversationApi {
    client: reqwest::Client,
    api_base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ConversationApi {
    pub fn new(client: reqwest::Client, api_base_url: String, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            api_base_url,
            tokens,
        }
    }

    fn bearer(&self) -> Result<String, SyncError> {
        match self.tokens.token() {
            Some(token) => Ok(format!("Bearer {}", token)),
            None => Err(SyncError::Unauthorized),
        }
    }
}

fn check_auth(status: StatusCode) -> Result<(), SyncError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::Unauthorized);
    }
    Ok(())
}

/// 把列表响应体宽松解析为远端会话
///
/// 空响应按空列表处理；整体解析失败按空列表处理（历史展示不该因为单次
/// 坏响应整体失败）；单项解析失败只跳过该项。
fn decode_conversation_list(body: &str) -> Vec<RemoteConversation> {
    if body.trim().is_empty() {
        info!("[ConvAPI] 服务端返回空响应，按空列表处理");
        return Vec::new();
    }

    let items: Vec<serde_json::Value> = match serde_json::from_str(body) {
        Ok(items) => items,
        Err(e) => {
            warn!("[ConvAPI] 会话列表解析失败，按空列表处理: {}", e);
            return Vec::new();
        }
    };

    let mut conversations = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<RemoteConversation>(item) {
            Ok(conv) => conversations.push(conv),
            Err(e) => warn!("[ConvAPI] 跳过无法解析的会话条目: {}", e),
        }
    }
    conversations
}

#[async_trait]
impl ConversationBackend for ConversationApi {
    async fn fetch_conversations(&self) -> Result<Vec<RemoteConversation>, SyncError> {
        let bearer = self.bearer()?;
        let url = format!("{}/conversations", self.api_base_url);

        info!("[ConvAPI] 📡 拉取远端会话列表");
        debug!("[ConvAPI]   请求URL: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", &bearer)
            .send()
            .await
            .map_err(SyncError::http)?;

        let status = response.status();
        check_auth(status)?;
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!("HTTP {}: {}", status, text)));
        }

        let text = response.text().await.map_err(SyncError::http)?;
        let conversations = decode_conversation_list(&text);

        info!("[ConvAPI] ✅ 拉取到 {} 条远端会话", conversations.len());
        Ok(conversations)
    }

    async fn save_conversation(
        &self,
        payload: &ConversationPayload,
    ) -> Result<RemoteConversation, SyncError> {
        let bearer = self.bearer()?;
        let url = format!("{}/conversations", self.api_base_url);

        info!(
            "[ConvAPI] 📡 上传会话，问答对数: {}",
            payload.conversation.len()
        );
        debug!("[ConvAPI]   请求URL: {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", &bearer)
            .json(payload)
            .send()
            .await
            .map_err(SyncError::http)?;

        let status = response.status();
        check_auth(status)?;
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // 尽量透传服务端的 detail
            if let Ok(err) = serde_json::from_str::<ErrorDetail>(&text) {
                return Err(SyncError::Transport(format!("HTTP {}: {}", status, err.detail)));
            }
            return Err(SyncError::Transport(format!("HTTP {}: {}", status, text)));
        }

        let saved: RemoteConversation = response
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("上传响应解析失败: {}", e)))?;

        info!("[ConvAPI] ✅ 上传成功，服务端ID: {}", saved.id);
        Ok(saved)
    }

    async fn delete_conversation(&self, remote_id: i64) -> Result<(), SyncError> {
        let bearer = self.bearer()?;
        let url = format!("{}/conversations/{}", self.api_base_url, remote_id);

        info!("[ConvAPI] 📡 删除远端会话: {}", remote_id);
        debug!("[ConvAPI]   请求URL: {}", url);

        let response = self
            .client
            .delete(&url)
            .header("Authorization", &bearer)
            .send()
            .await
            .map_err(SyncError::http)?;

        let status = response.status();
        check_auth(status)?;
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!("HTTP {}: {}", status, text)));
        }

        info!("[ConvAPI] ✅ 远端会话已删除: {}", remote_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_decodes_to_empty_list() {
        assert!(decode_conversation_list("").is_empty());
        assert!(decode_conversation_list("   \n").is_empty());
    }

    #[test]
    fn test_undecodable_body_decodes_to_empty_list() {
        // 网关错误页之类的非 JSON 响应
        assert!(decode_conversation_list("<html>502 Bad Gateway</html>").is_empty());
        // 合法 JSON 但不是数组
        assert!(decode_conversation_list(r#"{"detail":"oops"}"#).is_empty());
    }

    #[test]
    fn test_undecodable_items_are_skipped() {
        let body = r#"[
            {"id": 1, "created_at": "2024-05-01T10:00:00Z",
             "conversation": [{"question": "Q", "answer": "A"}]},
            {"id": "not-a-number", "created_at": "2024-05-01T10:00:00Z"},
            {"id": 2, "created_at": "2024-05-01T10:00:00Z"}
        ]"#;

        let list = decode_conversation_list(body);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, 1);
        assert_eq!(list[0].conversation.len(), 1);
        assert_eq!(list[1].id, 2);
        // conversation 字段缺省按空列表
        assert!(list[1].conversation.is_empty());
    }
}
