use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

// Use anyhow::Result for internal error handling (config loading etc.)
// Use thiserror for well-typed errors that need to be handled specifically

/// Application-specific errors that need special handling
#[derive(Error, Debug)]
pub enum AppError {
    /// 请求体缺失或形状不对（与路由期望的类型不匹配）
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 上游 AI 服务返回非 2xx 或网络失败
    #[error("Upstream error: {message}")]
    UpstreamError { status: u16, message: String },

    /// 凭据提供器无法产生可用的授权头
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::UpstreamError {
            status,
            message: message.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalServerError(msg.into())
    }
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::UpstreamError { status, message } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                message.clone(),
            ),
            AppError::CredentialUnavailable(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let error_type = match &self {
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::NotFound(_) => "not_found",
            AppError::UpstreamError { .. } => "upstream_error",
            AppError::CredentialUnavailable(_) => "credential_unavailable",
            AppError::ConfigError(_) => "config_error",
            AppError::InternalServerError(_) => "internal_error",
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Convert from anyhow::Error to AppError for error context
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Application error: {:?}", err);
        AppError::InternalServerError(err.to_string())
    }
}

/// Helper type for results that use AppError
pub type AppResult<T> = Result<T, AppError>;
