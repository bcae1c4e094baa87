use axum::response::sse;
use serde::Serialize;

/// Kind of a normalized relay event emitted to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEventKind {
    /// Downstream transport established (retrieval route)
    Connected,
    /// Assistant response opened (chat route)
    Start,
    /// Incremental chat content
    Update,
    /// Reasoning preamble content (retrieval route)
    Thinking,
    /// Answer content (retrieval route)
    Result,
    /// Terminal: full accumulated content
    Complete,
    /// Terminal: human-readable error
    Error,
}

impl RelayEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Start => "start",
            Self::Update => "update",
            Self::Thinking => "thinking",
            Self::Result => "result",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// The normalized unit emitted downstream.
///
/// For a given client connection events are emitted in a single total order
/// matching upstream arrival; `complete`/`error` is always last and the
/// connection closes right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub kind: RelayEventKind,
    pub content: Option<String>,
    pub error: Option<String>,
    pub role: Option<String>,
}

#[derive(Serialize)]
struct WireData<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl RelayEvent {
    fn new(kind: RelayEventKind) -> Self {
        Self {
            kind,
            content: None,
            error: None,
            role: None,
        }
    }

    pub fn connected() -> Self {
        Self::new(RelayEventKind::Connected)
    }

    /// Assistant response opened: empty content, assistant role.
    pub fn start() -> Self {
        let mut ev = Self::new(RelayEventKind::Start);
        ev.role = Some("assistant".to_string());
        ev.content = Some(String::new());
        ev
    }

    pub fn update(content: impl Into<String>) -> Self {
        let mut ev = Self::new(RelayEventKind::Update);
        ev.content = Some(content.into());
        ev
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        let mut ev = Self::new(RelayEventKind::Thinking);
        ev.content = Some(content.into());
        ev
    }

    pub fn result(content: impl Into<String>) -> Self {
        let mut ev = Self::new(RelayEventKind::Result);
        ev.content = Some(content.into());
        ev
    }

    pub fn complete(content: impl Into<String>) -> Self {
        let mut ev = Self::new(RelayEventKind::Complete);
        ev.content = Some(content.into());
        ev
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut ev = Self::new(RelayEventKind::Error);
        ev.error = Some(message.into());
        ev
    }

    /// Terminal events close the connection; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, RelayEventKind::Complete | RelayEventKind::Error)
    }

    /// Render as a downstream SSE event: `event: <kind>\ndata: <json>`.
    pub fn to_sse_event(&self) -> sse::Event {
        let data = WireData {
            status: (self.kind == RelayEventKind::Connected).then_some("connected"),
            role: self.role.as_deref(),
            content: self.content.as_deref(),
            error: self.error.as_deref(),
        };
        sse::Event::default()
            .event(self.kind.as_str())
            // serialization of this shape cannot fail
            .json_data(&data)
            .unwrap_or_else(|_| sse::Event::default().event(self.kind.as_str()).data("{}"))
    }
}
