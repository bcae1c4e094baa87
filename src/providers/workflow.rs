use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    config::WorkflowProviderConfig, credentials::CredentialProvider, errors::AppError,
    providers::check_status,
};

/// Keyword submitted by the creation tool
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Keyword {
    pub name: String,
}

/// One part of a four-part generated story
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoryPart {
    pub title: String,
    pub content: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Public response of the creation endpoint
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GeneratedStory {
    pub text: String,
    pub images: Vec<String>,
    pub story_parts: Vec<StoryPart>,
}

/// Workflow adapter for the text/image generation workflow.
///
/// Auth is delegated to the credential provider; the adapter only ever sees
/// a fully-formed authorization header string. The endpoint is non-streaming
/// from our side, but its response body may itself contain an SSE-formatted
/// string carrying the real payload (streaming inside non-streaming), which
/// `unwrap_envelope` digs out.
pub struct WorkflowProvider {
    config: WorkflowProviderConfig,
    client: Client,
    credentials: Arc<CredentialProvider>,
}

impl WorkflowProvider {
    pub fn new(
        config: WorkflowProviderConfig,
        client: Client,
        credentials: Arc<CredentialProvider>,
    ) -> Self {
        Self {
            config,
            client,
            credentials,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/workflows/chat",
            self.config.api_base.trim_end_matches('/')
        )
    }

    fn build_request(&self, keywords: &[Keyword]) -> Value {
        let joined = keywords
            .iter()
            .map(|k| k.name.as_str())
            .collect::<Vec<_>>()
            .join("，");
        json!({
            "workflow_id": self.config.workflow_id,
            "app_id": self.config.app_id,
            "parameters": {
                "keywords": joined,
                // 指示工作流生成四段式故事结构
                "story_structure": "four_part"
            },
            "additional_messages": [{
                "content": format!(
                    "请根据关键词「{joined}」创作一个完整的四段式木鱼书故事，\
                     分别包含：起式、承转、高潮、收结四个部分，每个部分配一张相应的图片。"
                ),
                "content_type": "text",
                "role": "user",
                "type": "question"
            }]
        })
    }

    /// Generate a story from keywords via the workflow endpoint.
    pub async fn generate(&self, keywords: &[Keyword]) -> Result<GeneratedStory, AppError> {
        let auth_header = self.credentials.authorization_header().await?;
        let body = self.build_request(keywords);

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", auth_header)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AppError::upstream(502, format!("Failed to reach workflow provider: {e}"))
            })?;
        let response = check_status(response, "workflow").await?;

        let raw = response.text().await.map_err(|e| {
            AppError::upstream(502, format!("Failed to read workflow response: {e}"))
        })?;

        let envelope = unwrap_envelope(&raw);
        Ok(assemble_story(envelope))
    }
}

/// Extract the real payload from the workflow response body.
///
/// The body is either plain JSON, or an SSE transcript whose `data: {...}`
/// line holds an event with a `content` field that is itself a JSON string.
/// Fails soft: when nothing matches, the whole body is handed back as a
/// fallback `{"text": ...}` value.
pub fn unwrap_envelope(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() {
            return value;
        }
    }

    for line in raw.lines() {
        if !(line.starts_with("data: {") && line.contains("\"content\":")) {
            continue;
        }
        let json_str = &line["data: ".len()..];
        let Ok(event) = serde_json::from_str::<Value>(json_str) else {
            tracing::warn!("failed to parse workflow SSE data line, skipping");
            continue;
        };
        if let Some(content) = event.get("content").and_then(Value::as_str) {
            if content.starts_with('{') {
                match serde_json::from_str::<Value>(content) {
                    Ok(inner) => return inner,
                    Err(e) => tracing::warn!("failed to parse nested workflow content: {e}"),
                }
            }
        }
    }

    json!({ "text": raw })
}

/// Placeholder image URL used when the workflow returns fewer images than
/// story parts. Kept from the original behavior; revisit against real
/// provider output.
fn placeholder_image(index: usize) -> String {
    format!("https://picsum.photos/seed/{index}/800/800")
}

/// Build the public story response from the decoded workflow payload.
pub fn assemble_story(data: Value) -> GeneratedStory {
    let mut story_parts: Vec<StoryPart> = Vec::new();
    let mut images: Vec<String> = Vec::new();

    if let Some(parts) = data.get("content").and_then(Value::as_array) {
        story_parts = parts
            .iter()
            .map(|part| StoryPart {
                title: part
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                content: part
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: part
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                image: None,
            })
            .collect();
    }

    let text = if story_parts.is_empty() {
        data.get("text")
            .or_else(|| data.get("response"))
            .and_then(Value::as_str)
            .unwrap_or("木鱼书文本生成成功")
            .to_string()
    } else {
        story_parts
            .iter()
            .map(|part| format!("【{}】{}", part.title, part.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    if let Some(imgs) = data.get("image").and_then(Value::as_array) {
        images = imgs
            .iter()
            .filter(|img| img.get("msg").and_then(Value::as_str) == Some("success"))
            .filter_map(|img| img.get("data").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
    }

    // 图片按序分配给各故事部分，数量不足时循环复用或使用占位图
    if images.is_empty() {
        for (i, part) in story_parts.iter_mut().enumerate() {
            let url = placeholder_image(i);
            part.image = Some(url.clone());
            images.push(url);
        }
    } else {
        let available = images.len();
        for (i, part) in story_parts.iter_mut().enumerate() {
            let url = if i < available {
                images[i].clone()
            } else {
                tracing::debug!(part = i + 1, "image count mismatch, reusing image");
                images[i % available].clone()
            };
            part.image = Some(url);
        }
    }

    GeneratedStory {
        text,
        images,
        story_parts,
    }
}
