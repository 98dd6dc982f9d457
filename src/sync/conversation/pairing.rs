//! 问答对重建
//!
//! 把扁平的消息流按时间轴还原成「问题 → 回答」对：assistant/system 消息设置
//! 当前问题，随后的第一条 user 消息与之配对并清空问题。问题之前的 user 消息、
//! 连续 user 消息中的后续几条都会被丢弃——它们通常是 UI 产物（比如开场的
//! "Start" 确认）。

use crate::sync::conversation::models::{LocalConversation, LocalMessage, MessageRole};
use crate::sync::types::QuestionAnswerPair;

/// 上传话题截断长度（字符数）
const SYNCED_TOPIC_MAX_CHARS: usize = 50;

/// 下载物化时话题的前缀，标记这条会话来自同步
const SYNCED_TOPIC_PREFIX: &str = "Synced: ";

/// 把会话的消息流重建为问答对
///
/// 输入不要求有序，内部按 timestamp 升序重排后再走配对状态。
/// 返回空列表表示没有任何可上传的内容。
pub fn build_qa_pairs(
    conversation: &LocalConversation,
    messages: &[LocalMessage],
) -> Vec<QuestionAnswerPair> {
    let mut sorted: Vec<&LocalMessage> = messages.iter().collect();
    sorted.sort_by_key(|m| m.timestamp);

    let mut pairs = Vec::new();
    let mut current_question: Option<&str> = None;

    for message in sorted {
        match message.role {
            MessageRole::Assistant | MessageRole::System => {
                // 新问题覆盖旧问题；没等到回答的问题直接丢弃
                current_question = Some(message.content.as_str());
            }
            MessageRole::User => {
                if let Some(question) = current_question.take() {
                    let mut pair = QuestionAnswerPair::new(question, message.content.as_str());
                    pair.part = Some(1);
                    pair.topic = Some(conversation.topic.clone());
                    pair.answer_length = Some(message.content.chars().count() as i32);
                    pairs.push(pair);
                }
                // 没有挂起问题的 user 消息（开场 "Start" 之类）不配对
            }
            MessageRole::Error => {
                // 错误提示不属于对话内容
            }
        }
    }

    pairs
}

/// 由第一条问题推导物化会话的话题
///
/// 截断到固定长度并加前缀，和设备端创建的话题区分开。
pub fn derive_synced_topic(first_question: &str) -> String {
    let prefix: String = first_question.chars().take(SYNCED_TOPIC_MAX_CHARS).collect();
    format!("{}{}", SYNCED_TOPIC_PREFIX, prefix)
}
