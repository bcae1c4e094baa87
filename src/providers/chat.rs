use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ChatProviderConfig,
    errors::AppError,
    providers::{ByteStream, StreamingUpstream, check_status, into_byte_stream},
    session::SessionPayload,
};

/// 小木鱼助手的系统角色设定，客户端历史里没有 system 消息时注入
const SYSTEM_PROMPT: &str = "你是一位专注于木鱼书研究的助手，熟悉木鱼书的起源发展、\
表演形式、代表作品、音乐唱腔以及非遗传承保护现状，用简体中文简明准确地回答相关问题；\
与木鱼书、岭南文化及传统文化无关的问题请礼貌地说明不在解答范围内。";

/// Message structure for chat conversations
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String, // "system", "user" or "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.role.as_str(), "system" | "user" | "assistant") {
            return Err(format!(
                "Invalid role '{}': must be 'system', 'user' or 'assistant'",
                self.role
            ));
        }
        if self.content.is_empty() {
            return Err("Message content cannot be empty".to_string());
        }
        if self.content.len() > 100_000 {
            return Err("Message content too long (max 100KB)".to_string());
        }
        Ok(())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for the chat-completion endpoint
#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// Chat adapter for the assistant dialogue (OpenAI-style chat completions).
///
/// Streaming frames are `data: {json}` lines where
/// `choices[0].delta.content` carries incremental text and `data: [DONE]`
/// terminates the stream.
pub struct ChatProvider {
    config: ChatProviderConfig,
    client: Client,
}

impl ChatProvider {
    pub fn new(config: ChatProviderConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// 确保消息数组中包含系统提示词
    fn with_system_prompt(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if messages.iter().any(|m| m.role == "system") {
            return messages.to_vec();
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(ChatMessage::system(SYSTEM_PROMPT));
        out.extend_from_slice(messages);
        out
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response, AppError> {
        let messages = self.with_system_prompt(messages);
        let body = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            stream,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::upstream(502, format!("Failed to reach chat provider: {e}")))?;

        check_status(response, "chat").await
    }

    /// Non-streaming chat call. Returns the provider's JSON body as-is.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<Value, AppError> {
        let response = self.send(messages, false).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::upstream(502, format!("Failed to parse chat response: {e}")))
    }
}

#[async_trait]
impl StreamingUpstream for ChatProvider {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn open_stream(&self, payload: &SessionPayload) -> Result<ByteStream, AppError> {
        let SessionPayload::Chat(messages) = payload else {
            return Err(AppError::invalid_payload(
                "chat stream requires a message-list payload",
            ));
        };
        let response = self.send(messages, true).await?;
        Ok(into_byte_stream(response, "chat"))
    }
}
