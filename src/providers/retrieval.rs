use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    config::RetrievalProviderConfig,
    errors::AppError,
    providers::{ByteStream, StreamingUpstream, check_status, into_byte_stream},
    session::SessionPayload,
};

#[derive(Serialize, Debug)]
struct AdditionalMessage<'a> {
    content: &'a str,
    content_type: &'static str,
    role: &'static str,
    #[serde(rename = "type")]
    message_type: &'static str,
}

#[derive(Serialize, Debug)]
struct RetrievalRequest<'a> {
    bot_id: &'a str,
    user_id: String,
    stream: bool,
    additional_messages: Vec<AdditionalMessage<'a>>,
    parameters: Value,
}

/// Retrieval adapter for the muyu shu catalog search agent.
///
/// The upstream is a bot conversation API whose streaming responses use
/// `event:`-typed SSE frames (`conversation.message.delta`,
/// `conversation.chat.completed`, ...). The agent interleaves a reasoning
/// preamble and the final answer inside the delta contents; splitting the two
/// is the relay engine's job, not the adapter's.
pub struct RetrievalProvider {
    config: RetrievalProviderConfig,
    client: Client,
}

impl RetrievalProvider {
    pub fn new(config: RetrievalProviderConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!("{}/v3/chat", self.config.api_base.trim_end_matches('/'))
    }

    fn build_request<'a>(&'a self, query: &'a str, stream: bool) -> RetrievalRequest<'a> {
        RetrievalRequest {
            bot_id: &self.config.bot_id,
            // 每次检索生成唯一用户ID
            user_id: format!("search_{}", Uuid::new_v4().simple()),
            stream,
            additional_messages: vec![AdditionalMessage {
                content: query,
                content_type: "text",
                role: "user",
                message_type: "question",
            }],
            parameters: Value::Object(Default::default()),
        }
    }

    async fn send(&self, query: &str, stream: bool) -> Result<reqwest::Response, AppError> {
        let body = self.build_request(query, stream);
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AppError::upstream(502, format!("Failed to reach retrieval provider: {e}"))
            })?;

        check_status(response, "retrieval").await
    }

    /// Non-streaming search call. Returns the provider's JSON body as-is.
    pub async fn search(&self, query: &str) -> Result<Value, AppError> {
        let response = self.send(query, false).await?;
        response.json::<Value>().await.map_err(|e| {
            AppError::upstream(502, format!("Failed to parse retrieval response: {e}"))
        })
    }
}

#[async_trait]
impl StreamingUpstream for RetrievalProvider {
    fn name(&self) -> &'static str {
        "retrieval"
    }

    async fn open_stream(&self, payload: &SessionPayload) -> Result<ByteStream, AppError> {
        let SessionPayload::Search(query) = payload else {
            return Err(AppError::invalid_payload(
                "search stream requires a query payload",
            ));
        };
        let response = self.send(query, true).await?;
        Ok(into_byte_stream(response, "retrieval"))
    }
}
