pub mod chat;
pub mod retrieval;
pub mod workflow;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::errors::AppError;
use crate::session::SessionPayload;

// Re-export the adapters for easier access
pub use chat::ChatProvider;
pub use retrieval::RetrievalProvider;
pub use workflow::WorkflowProvider;

/// Raw byte chunks as they arrive from an upstream streaming response.
///
/// The sequence is lazily produced, finite and non-restartable. A mid-stream
/// transport failure surfaces as an `Err` item, not a panic, because response
/// headers are already committed by the time it happens.
pub type ByteStream = BoxStream<'static, Result<Bytes, AppError>>;

/// An upstream adapter that can be driven by the streaming relay engine.
///
/// Each implementation knows its own endpoint, auth header construction and
/// request body shape; the relay only sees raw bytes coming back.
#[async_trait]
pub trait StreamingUpstream: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Issue the streaming HTTP call for the given payload.
    ///
    /// Fails with `UpstreamError` if the handshake fails or the payload kind
    /// does not match this adapter.
    async fn open_stream(&self, payload: &SessionPayload) -> Result<ByteStream, AppError>;
}

/// Map a reqwest body stream into a `ByteStream`, converting transport
/// errors into `UpstreamError` items.
pub(crate) fn into_byte_stream(response: reqwest::Response, provider: &'static str) -> ByteStream {
    use futures::StreamExt;

    Box::pin(response.bytes_stream().map(move |chunk| {
        chunk.map_err(|e| AppError::upstream(502, format!("{provider} stream error: {e}")))
    }))
}

/// Shared non-2xx handling for adapter handshakes.
pub(crate) async fn check_status(
    response: reqwest::Response,
    provider: &'static str,
) -> Result<reqwest::Response, AppError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(AppError::upstream(
        status,
        format!("{provider} API error: {body}"),
    ))
}
