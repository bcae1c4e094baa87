use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use muyu_api::errors::AppError;
use muyu_api::providers::{ByteStream, StreamingUpstream};
use muyu_api::relay::{
    Frame, FrameBuffer, PhaseClassifier, RelayEngine, RelayEvent, RelayEventKind, RelayRoute,
    Translator,
};
use muyu_api::session::{SessionPayload, SessionStore};

const DELIMITER: &str = "##################";

// --- Frame reassembly ---

fn parse_all(chunks: &[&[u8]]) -> Vec<Frame> {
    let mut buffer = FrameBuffer::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        frames.extend(buffer.push(chunk));
    }
    frames
}

#[test]
fn single_chunk_yields_one_frame() {
    let frames = parse_all(&[b"event: done\ndata: {\"x\":1}\n\n"]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event.as_deref(), Some("done"));
    assert_eq!(frames[0].data, "{\"x\":1}");
}

/// An event name split across two network chunks still yields one frame.
#[test]
fn frame_split_mid_event_name() {
    let frames = parse_all(&[
        b"event: conversation.mess",
        "age.delta\ndata: {\"content\":\"\u{4f60}\u{597d}\"}\n\n".as_bytes(),
    ]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event.as_deref(), Some("conversation.message.delta"));
    assert_eq!(frames[0].data, "{\"content\":\"你好\"}");
}

/// Parsing is invariant under arbitrary byte-offset splits, even splits that
/// land inside a multi-byte character.
#[test]
fn frame_parsing_is_split_invariant() {
    let transcript = "event: conversation.message.delta\ndata: {\"content\":\"正在分析\"}\n\n\
                      event: conversation.message.delta\ndata: {\"content\":\"花笺记\"}\n\n\
                      event: conversation.chat.completed\ndata: {}\n\n";
    let bytes = transcript.as_bytes();

    let whole = parse_all(&[bytes]);
    assert_eq!(whole.len(), 3);

    for split_at in 1..bytes.len() {
        let (a, b) = bytes.split_at(split_at);
        let parts = parse_all(&[a, b]);
        assert_eq!(parts, whole, "split at byte {split_at} diverged");
    }
}

#[test]
fn partial_trailing_frame_is_not_parsed_prematurely() {
    let mut buffer = FrameBuffer::new();
    assert!(buffer.push(b"event: done\ndata: pending").is_empty());
    let frames = buffer.push(b"\n\n");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, "pending");
}

#[test]
fn multiple_data_lines_are_joined() {
    let frames = parse_all(&[b"data: line1\ndata: line2\n\n"]);
    assert_eq!(frames[0].data, "line1\nline2");
}

#[test]
fn crlf_line_endings_are_tolerated() {
    let frames = parse_all(&[b"event: done\r\ndata: ok\r\n\r\n"]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event.as_deref(), Some("done"));
    assert_eq!(frames[0].data, "ok");
}

#[test]
fn block_without_data_line_is_skipped() {
    let frames = parse_all(&[b"event: ping\n\ndata: real\n\n"]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, "real");
}

// --- Phase classification ---

#[test]
fn content_before_delimiter_is_thinking() {
    let mut classifier = PhaseClassifier::new(DELIMITER);
    let event = classifier.classify("正在分析您的查询...").unwrap();
    assert_eq!(event.kind, RelayEventKind::Thinking);
    assert_eq!(event.content.as_deref(), Some("正在分析您的查询..."));
}

/// A chunk containing the delimiter emits only the text after it, as result.
#[test]
fn delimiter_inside_chunk_emits_tail_as_result() {
    let mut classifier = PhaseClassifier::new(DELIMITER);
    let event = classifier
        .classify(&format!("...intro{DELIMITER}answer"))
        .unwrap();
    assert_eq!(event.kind, RelayEventKind::Result);
    assert_eq!(event.content.as_deref(), Some("answer"));
}

#[test]
fn delimiter_with_empty_tail_emits_nothing() {
    let mut classifier = PhaseClassifier::new(DELIMITER);
    assert!(classifier.classify(&format!("intro{DELIMITER}")).is_none());
    assert!(!classifier.is_thinking());
}

/// The delimiter crossing a chunk boundary still flips the phase; the chunk
/// that completes it is emitted entirely as result.
#[test]
fn delimiter_across_chunk_boundary_flips_phase() {
    let mut classifier = PhaseClassifier::new(DELIMITER);

    let first = classifier.classify("思考中#########").unwrap();
    assert_eq!(first.kind, RelayEventKind::Thinking);

    let second = classifier.classify("#########答案").unwrap();
    assert_eq!(second.kind, RelayEventKind::Result);
    assert_eq!(second.content.as_deref(), Some("#########答案"));
}

/// Phase monotonicity: after the first result, no thinking event ever follows.
#[test]
fn phase_flip_is_permanent() {
    let mut classifier = PhaseClassifier::new(DELIMITER);
    classifier.classify("前言");
    classifier.classify(&format!("{DELIMITER}答案一"));

    for fragment in ["答案二", "答案三", "答案四"] {
        let event = classifier.classify(fragment).unwrap();
        assert_eq!(event.kind, RelayEventKind::Result);
    }
}

/// Order preservation: concatenated fragments equal the full accumulation.
#[test]
fn accumulation_preserves_arrival_order() {
    let mut classifier = PhaseClassifier::new(DELIMITER);
    let fragments = ["木鱼书", "是广东地区的", "传统说唱艺术"];

    let mut emitted = String::new();
    for fragment in fragments {
        let event = classifier.classify(fragment).unwrap();
        emitted.push_str(event.content.as_deref().unwrap());
    }

    assert_eq!(emitted, fragments.concat());
    assert_eq!(classifier.full_content(), fragments.concat());
}

// --- Frame translation ---

fn frame(event: Option<&str>, data: &str) -> Frame {
    Frame {
        event: event.map(str::to_string),
        data: data.to_string(),
    }
}

#[test]
fn chat_delta_becomes_update() {
    let mut translator = Translator::new(RelayRoute::Chat, DELIMITER.to_string());
    let events = translator.translate(frame(
        None,
        r#"{"choices":[{"delta":{"content":"你好"}}]}"#,
    ));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Update);
    assert_eq!(events[0].content.as_deref(), Some("你好"));
}

#[test]
fn chat_done_completes_with_accumulated_content() {
    let mut translator = Translator::new(RelayRoute::Chat, DELIMITER.to_string());
    translator.translate(frame(None, r#"{"choices":[{"delta":{"content":"木鱼"}}]}"#));
    translator.translate(frame(None, r#"{"choices":[{"delta":{"content":"书"}}]}"#));

    let events = translator.translate(frame(None, "[DONE]"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Complete);
    assert_eq!(events[0].content.as_deref(), Some("木鱼书"));
}

/// One malformed frame must not abort an otherwise healthy stream.
#[test]
fn malformed_chat_frame_is_skipped() {
    let mut translator = Translator::new(RelayRoute::Chat, DELIMITER.to_string());
    assert!(translator.translate(frame(None, "{not json")).is_empty());

    let events = translator.translate(frame(
        None,
        r#"{"choices":[{"delta":{"content":"继续"}}]}"#,
    ));
    assert_eq!(events.len(), 1);
}

#[test]
fn retrieval_failed_event_becomes_error() {
    let mut translator = Translator::new(RelayRoute::Search, DELIMITER.to_string());
    let events = translator.translate(frame(Some("conversation.chat.failed"), "{}"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Error);
}

#[test]
fn retrieval_message_completed_is_ignored() {
    let mut translator = Translator::new(RelayRoute::Search, DELIMITER.to_string());
    assert!(
        translator
            .translate(frame(Some("conversation.message.completed"), "{}"))
            .is_empty()
    );
}

#[test]
fn retrieval_done_marker_completes() {
    let mut translator = Translator::new(RelayRoute::Search, DELIMITER.to_string());
    translator.translate(frame(
        Some("conversation.message.delta"),
        r#"{"content":"内容"}"#,
    ));
    let events = translator.translate(frame(Some("done"), "[DONE]"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Complete);
    assert_eq!(events[0].content.as_deref(), Some("内容"));
}

// --- Engine end-to-end with a scripted upstream ---

struct ScriptedUpstream {
    chunks: Vec<Result<Bytes, AppError>>,
}

impl ScriptedUpstream {
    fn new(chunks: Vec<Result<Bytes, AppError>>) -> Self {
        Self { chunks }
    }

    fn from_transcript(transcript: &str) -> Self {
        Self::new(vec![Ok(Bytes::copy_from_slice(transcript.as_bytes()))])
    }
}

#[async_trait]
impl StreamingUpstream for ScriptedUpstream {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open_stream(&self, _payload: &SessionPayload) -> Result<ByteStream, AppError> {
        let chunks: Vec<Result<Bytes, AppError>> = self
            .chunks
            .iter()
            .map(|c| match c {
                Ok(bytes) => Ok(bytes.clone()),
                Err(e) => Err(AppError::upstream(502, e.to_string())),
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

fn engine() -> RelayEngine {
    let store = Arc::new(SessionStore::new(Duration::from_secs(300)));
    RelayEngine::new(store, DELIMITER)
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Full search relay: connected, thinking, result, complete — in that order.
#[tokio::test]
async fn search_relay_produces_ordered_phases() {
    let transcript = format!(
        "event: conversation.message.delta\ndata: {{\"content\":\"正在检索...\"}}\n\n\
         event: conversation.message.delta\ndata: {{\"content\":\"{DELIMITER}花笺记是经典木鱼书\"}}\n\n\
         event: conversation.chat.completed\ndata: {{}}\n\n"
    );
    let upstream = Arc::new(ScriptedUpstream::from_transcript(&transcript));

    let engine = engine();
    engine
        .accept_payload("abc", SessionPayload::Search("花笺记".to_string()))
        .await;
    let rx = engine
        .open_stream("abc", RelayRoute::Search, upstream)
        .await;
    let events = collect(rx).await;

    let kinds: Vec<RelayEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RelayEventKind::Connected,
            RelayEventKind::Thinking,
            RelayEventKind::Result,
            RelayEventKind::Complete,
        ]
    );
    assert!(events[2].content.as_deref().unwrap().contains("花笺记"));
}

/// Terminal exactly-once: nothing follows the first complete, even when the
/// upstream keeps talking.
#[tokio::test]
async fn nothing_follows_the_terminal_event() {
    let transcript = format!(
        "event: conversation.message.delta\ndata: {{\"content\":\"{DELIMITER}答案\"}}\n\n\
         event: conversation.chat.completed\ndata: {{}}\n\n\
         event: conversation.message.delta\ndata: {{\"content\":\"多余\"}}\n\n"
    );
    let upstream = Arc::new(ScriptedUpstream::from_transcript(&transcript));

    let engine = engine();
    engine
        .accept_payload("t", SessionPayload::Search("q".to_string()))
        .await;
    let rx = engine.open_stream("t", RelayRoute::Search, upstream).await;
    let events = collect(rx).await;

    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().is_terminal());
}

/// Stream opened with no prior POST: exactly one error event, then close.
#[tokio::test]
async fn missing_session_yields_single_error_event() {
    let upstream = Arc::new(ScriptedUpstream::from_transcript(""));
    let engine = engine();

    let rx = engine
        .open_stream("nonexistent", RelayRoute::Search, upstream)
        .await;
    let events = collect(rx).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Error);
    assert!(events[0].error.as_deref().unwrap().contains("会话"));
}

/// A payload parked on one route cannot be picked up by the other.
#[tokio::test]
async fn wrong_route_payload_behaves_as_missing_session() {
    let upstream = Arc::new(ScriptedUpstream::from_transcript(""));
    let engine = engine();
    engine
        .accept_payload("abc", SessionPayload::Search("q".to_string()))
        .await;

    let rx = engine.open_stream("abc", RelayRoute::Chat, upstream).await;
    let events = collect(rx).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, RelayEventKind::Error);
}

/// Mid-stream transport failure surfaces as a terminal error event.
#[tokio::test]
async fn mid_stream_error_becomes_error_event() {
    let upstream = Arc::new(ScriptedUpstream::new(vec![
        Ok(Bytes::from_static(
            b"event: conversation.message.delta\ndata: {\"content\":\"a\"}\n\n",
        )),
        Err(AppError::upstream(502, "connection reset")),
    ]));

    let engine = engine();
    engine
        .accept_payload("e", SessionPayload::Search("q".to_string()))
        .await;
    let rx = engine.open_stream("e", RelayRoute::Search, upstream).await;
    let events = collect(rx).await;

    assert!(events.last().unwrap().kind == RelayEventKind::Error);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

/// Upstream EOF without a terminal marker still settles the session.
#[tokio::test]
async fn upstream_eof_without_marker_completes() {
    let transcript = "event: conversation.message.delta\ndata: {\"content\":\"只有一半\"}\n\n";
    let upstream = Arc::new(ScriptedUpstream::from_transcript(transcript));

    let engine = engine();
    engine
        .accept_payload("eof", SessionPayload::Search("q".to_string()))
        .await;
    let rx = engine.open_stream("eof", RelayRoute::Search, upstream).await;
    let events = collect(rx).await;

    let last = events.last().unwrap();
    assert_eq!(last.kind, RelayEventKind::Complete);
    assert_eq!(last.content.as_deref(), Some("只有一半"));
}

/// Chat relay opens with a start event carrying the assistant role.
#[tokio::test]
async fn chat_relay_opens_with_start_event() {
    let transcript = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n\n";
    let upstream = Arc::new(ScriptedUpstream::from_transcript(transcript));

    let engine = engine();
    engine
        .accept_payload(
            "c",
            SessionPayload::Chat(vec![muyu_api::providers::chat::ChatMessage::user("你好")]),
        )
        .await;
    let rx = engine.open_stream("c", RelayRoute::Chat, upstream).await;
    let events = collect(rx).await;

    assert_eq!(events[0].kind, RelayEventKind::Start);
    assert_eq!(events[0].role.as_deref(), Some("assistant"));
    assert_eq!(events[1].kind, RelayEventKind::Update);
    assert_eq!(events.last().unwrap().kind, RelayEventKind::Complete);
    assert_eq!(events.last().unwrap().content.as_deref(), Some("你好"));
}
