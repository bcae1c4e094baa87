//! Streaming relay engine.
//!
//! Bridges the client's split POST(payload)/GET(stream) pair: the payload is
//! parked in the session store by the POST, picked up when the EventSource
//! connection arrives, relayed through the matching upstream adapter, and
//! re-framed into the normalized downstream event schema.
//!
//! Per session the lifecycle is `AWAITING_PAYLOAD -> STREAMING ->
//! {COMPLETE | FAILED}`; exactly one terminal event (`complete` or `error`)
//! is emitted and the channel closes right after it.

pub mod event;
pub mod frame;
pub mod phase;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    providers::StreamingUpstream,
    session::{SessionPayload, SessionStore},
};

pub use event::{RelayEvent, RelayEventKind};
pub use frame::{Frame, FrameBuffer};
pub use phase::PhaseClassifier;

/// Message shown when the GET arrives with no matching payload.
const INVALID_SESSION: &str = "无效的会话ID或会话已过期";

/// Which client surface the relay session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRoute {
    /// Assistant chat: `start` + `update` events
    Chat,
    /// Catalog search: `connected` + `thinking`/`result` events
    Search,
}

/// The relay engine owns the session handoff store and drives upstream byte
/// streams into normalized event sequences.
pub struct RelayEngine {
    sessions: Arc<SessionStore>,
    delimiter: String,
}

impl RelayEngine {
    pub fn new(sessions: Arc<SessionStore>, delimiter: impl Into<String>) -> Self {
        Self {
            sessions,
            delimiter: delimiter.into(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Park a validated payload for later stream pickup.
    pub async fn accept_payload(&self, token: &str, payload: SessionPayload) {
        self.sessions.put(token, payload).await;
    }

    /// Open the relay for a client's persistent GET connection.
    ///
    /// Returns the receiving end of the session's event sequence; the driver
    /// task runs independently and stops as soon as the receiver is dropped
    /// (client disconnect) or a terminal event has been delivered.
    pub async fn open_stream(
        &self,
        token: &str,
        route: RelayRoute,
        upstream: Arc<dyn StreamingUpstream>,
    ) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(32);

        let payload = self.sessions.take(token).await;
        let payload = match (route, payload) {
            (RelayRoute::Chat, Some(p @ SessionPayload::Chat(_))) => p,
            (RelayRoute::Search, Some(p @ SessionPayload::Search(_))) => p,
            _ => {
                tracing::warn!(token, ?route, "stream opened with no pending payload");
                let _ = tx.send(RelayEvent::error(INVALID_SESSION)).await;
                return rx;
            }
        };

        // 直接中继一个已有的负载（POST 携带 stream=true 但无会话令牌的旧式路径）
        self.relay_payload(payload, route, upstream, tx);
        rx
    }

    /// Relay an already-obtained payload, bypassing the session store.
    pub fn relay_payload(
        &self,
        payload: SessionPayload,
        route: RelayRoute,
        upstream: Arc<dyn StreamingUpstream>,
        tx: mpsc::Sender<RelayEvent>,
    ) {
        let delimiter = self.delimiter.clone();
        tokio::spawn(async move {
            drive_session(payload, route, upstream, delimiter, tx).await;
        });
    }

    /// Convenience for the legacy direct-streaming path: spawns the relay
    /// and hands back the receiver.
    pub fn stream_payload(
        &self,
        payload: SessionPayload,
        route: RelayRoute,
        upstream: Arc<dyn StreamingUpstream>,
    ) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.relay_payload(payload, route, upstream, tx);
        rx
    }
}

/// Drive one relay session to its terminal event.
async fn drive_session(
    payload: SessionPayload,
    route: RelayRoute,
    upstream: Arc<dyn StreamingUpstream>,
    delimiter: String,
    tx: mpsc::Sender<RelayEvent>,
) {
    // 先发送连接确认/响应开启事件，再发起上游调用
    let opening = match route {
        RelayRoute::Chat => RelayEvent::start(),
        RelayRoute::Search => RelayEvent::connected(),
    };
    if tx.send(opening).await.is_err() {
        return;
    }

    let mut stream = match upstream.open_stream(&payload).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(provider = upstream.name(), "upstream handshake failed: {e}");
            let _ = tx.send(RelayEvent::error(e.to_string())).await;
            return;
        }
    };

    let mut buffer = FrameBuffer::new();
    let mut translator = Translator::new(route, delimiter);

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(provider = upstream.name(), "upstream stream error: {e}");
                let _ = tx.send(RelayEvent::error(e.to_string())).await;
                return;
            }
        };

        for frame in buffer.push(&bytes) {
            for relay_event in translator.translate(frame) {
                let terminal = relay_event.is_terminal();
                if tx.send(relay_event).await.is_err() {
                    // 客户端已断开：放弃上游流，不做部分结果恢复
                    tracing::debug!(provider = upstream.name(), "client gone, aborting relay");
                    return;
                }
                if terminal {
                    return;
                }
            }
        }
    }

    // Upstream closed without its terminal marker: still settle the session
    // with everything accumulated so far.
    tracing::debug!(provider = upstream.name(), "upstream ended without terminal marker");
    let _ = tx
        .send(RelayEvent::complete(translator.into_full_content()))
        .await;
}

/// Translates provider-specific frames into normalized relay events.
///
/// One translator instance per session; it owns the running content
/// accumulation and, for the search route, the phase classifier.
pub enum Translator {
    Chat { accumulated: String },
    Search { classifier: PhaseClassifier },
}

impl Translator {
    pub fn new(route: RelayRoute, delimiter: String) -> Self {
        match route {
            RelayRoute::Chat => Self::Chat {
                accumulated: String::new(),
            },
            RelayRoute::Search => Self::Search {
                classifier: PhaseClassifier::new(delimiter),
            },
        }
    }

    /// Translate one upstream frame into zero or more relay events.
    ///
    /// Malformed frame payloads are logged and skipped; one bad frame must
    /// not abort an otherwise healthy stream.
    pub fn translate(&mut self, frame: Frame) -> Vec<RelayEvent> {
        match self {
            Self::Chat { accumulated } => translate_chat(frame, accumulated),
            Self::Search { classifier } => translate_search(frame, classifier),
        }
    }

    /// The full accumulated content, for settling a stream that ended
    /// without a terminal marker.
    pub fn into_full_content(self) -> String {
        match self {
            Self::Chat { accumulated } => accumulated,
            Self::Search { classifier } => classifier.full_content().to_string(),
        }
    }
}

/// Chat-completion frames: `data: {json}` deltas, `data: [DONE]` terminal.
fn translate_chat(frame: Frame, accumulated: &mut String) -> Vec<RelayEvent> {
    if frame.data == "[DONE]" {
        return vec![RelayEvent::complete(accumulated.clone())];
    }

    let parsed: Value = match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("skipping malformed chat frame: {e}");
            return Vec::new();
        }
    };

    let Some(content) = parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };

    if content.is_empty() {
        return Vec::new();
    }
    accumulated.push_str(content);
    vec![RelayEvent::update(content)]
}

/// Agent conversation frames, dispatched on the `event:` type.
fn translate_search(frame: Frame, classifier: &mut PhaseClassifier) -> Vec<RelayEvent> {
    // 数据级结束标记
    if frame.data == "[DONE]" || frame.data == "\"[DONE]\"" {
        return vec![RelayEvent::complete(classifier.full_content())];
    }

    let event_type = frame.event.as_deref().unwrap_or("");
    match event_type {
        "conversation.message.delta" => {
            let parsed: Value = match serde_json::from_str(&frame.data) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("skipping malformed retrieval frame: {e}");
                    return Vec::new();
                }
            };
            let Some(content) = parsed.get("content").and_then(Value::as_str) else {
                return Vec::new();
            };
            classifier.classify(content).into_iter().collect()
        }
        // 消息完成时不结束连接，等待对话完成
        "conversation.message.completed" => Vec::new(),
        "conversation.chat.completed" | "done" => {
            vec![RelayEvent::complete(classifier.full_content())]
        }
        "conversation.chat.failed" => {
            vec![RelayEvent::error("搜索失败，请稍后重试")]
        }
        other => {
            tracing::debug!(event = other, "unhandled retrieval event type");
            Vec::new()
        }
    }
}
