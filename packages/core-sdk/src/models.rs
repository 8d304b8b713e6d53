use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use serde_json::json;

/**
 * \brief 可持久化的消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow!("unsupported role: {}", other)),
        }
    }
}

/**
 * \brief 发往上游的消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Self {
            role: stored.role,
            content: stored.content,
        }
    }
}

/**
 * \brief 会话记录。`user_id` 为空表示匿名会话。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: i64,
    pub title: String,
    pub user_id: Option<i64>,
    pub model_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 持久化后的消息行。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /** \brief 消息行主键。 */
    pub id: i64,
    pub chat_id: i64,
    pub role: Role,
    pub content: String,
    /** \brief 推理过程，仅推理模型的助手消息才可能存在。 */
    pub reasoning: Option<String>,
    /** \brief 会话内单调递增的顺序号。 */
    pub order: i64,
    pub created_at: String,
}

/**
 * \brief 会话及其消息（列表接口只携带首条消息作为预览）。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: ChatRecord,
    pub messages: Vec<StoredMessage>,
}

/**
 * \brief 静态模型描述，决定上游地址与是否透传推理过程。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub has_reasoning: bool,
}

/**
 * \brief 上游流式协议中的一个增量。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

impl Delta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            reasoning: None,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            content: None,
            reasoning: Some(text.into()),
        }
    }
}

/**
 * \brief 非流式调用的完整回复。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub content: String,
    pub reasoning: Option<String>,
}

/**
 * \brief 中继向客户端推送的事件。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Content(String),
    Reasoning(String),
    Error(String),
    Done,
}

/** \brief 流结束哨兵。 */
pub const DONE_SENTINEL: &str = "[DONE]";

impl RelayEvent {
    /**
     * \brief 序列化为 SSE `data:` 字段内容。
     */
    pub fn to_sse_data(&self) -> String {
        match self {
            RelayEvent::Content(text) => json!({ "content": text, "type": "content" }).to_string(),
            RelayEvent::Reasoning(text) => {
                json!({ "content": text, "type": "reasoning" }).to_string()
            }
            RelayEvent::Error(message) => json!({ "error": message }).to_string(),
            RelayEvent::Done => DONE_SENTINEL.to_string(),
        }
    }
}
