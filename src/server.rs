use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::header,
    response::{
        Html, IntoResponse, Json, Response,
        sse::{KeepAlive, Sse},
    },
    routing::get,
};
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    catalog,
    config::Config,
    credentials::CredentialProvider,
    errors::{AppError, AppResult},
    providers::{
        ChatProvider, RetrievalProvider, StreamingUpstream, WorkflowProvider, chat::ChatMessage,
        workflow::{GeneratedStory, Keyword},
    },
    relay::{RelayEngine, RelayEvent, RelayRoute},
    session::{SessionPayload, SessionStore},
};

/// 演示数据标记：宽松模式下占位数据以此开头，与真实上游结果区分
pub const DEMO_MARKER: &str = "【演示数据】";

/// 应用程序状态 - 在所有请求处理器之间共享
///
/// 包含请求处理器所需的所有共享资源：配置、HTTP客户端、
/// 会话存储、中继引擎和三个上游适配器。
#[derive(Clone)]
pub struct AppState {
    /// 应用程序配置（只读共享）
    pub config: Arc<Config>,
    /// HTTP客户端，用于与上游AI提供商通信
    pub http_client: Client,
    /// 会话交接存储
    pub sessions: Arc<SessionStore>,
    /// 流式中继引擎
    pub relay: Arc<RelayEngine>,
    /// 对话适配器
    pub chat: Arc<ChatProvider>,
    /// 检索适配器
    pub retrieval: Arc<RetrievalProvider>,
    /// 工作流适配器
    pub workflow: Arc<WorkflowProvider>,
    /// OAuth凭据提供器
    pub credentials: Arc<CredentialProvider>,
}

impl AppState {
    /// Create new application state from configuration
    pub fn new(config: Config) -> AppResult<Self> {
        let upstream_timeout = Duration::from_secs(config.relay.upstream_timeout_seconds);

        // Streaming responses outlive any total request timeout, so bound the
        // handshake and the inter-chunk gap instead.
        let http_client = Client::builder()
            .connect_timeout(upstream_timeout)
            .read_timeout(upstream_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to create HTTP client: {e}")))?;

        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            config.relay.session_ttl_seconds,
        )));
        let relay = Arc::new(RelayEngine::new(
            sessions.clone(),
            config.relay.result_delimiter.clone(),
        ));
        let credentials = Arc::new(CredentialProvider::new(
            config.oauth.clone(),
            http_client.clone(),
        ));
        let chat = Arc::new(ChatProvider::new(
            config.providers.chat.clone(),
            http_client.clone(),
        ));
        let retrieval = Arc::new(RetrievalProvider::new(
            config.providers.retrieval.clone(),
            http_client.clone(),
        ));
        let workflow = Arc::new(WorkflowProvider::new(
            config.providers.workflow.clone(),
            http_client.clone(),
            credentials.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            http_client,
            sessions,
            relay,
            chat,
            retrieval,
            workflow,
            credentials,
        })
    }
}

/// Create the main application router with all routes and middleware
pub fn create_app(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_seconds);

    // 普通请求受整体超时约束，超时返回 408
    let plain = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/muyu-catalog", get(catalog_handler))
        .route("/api/muyu-book/{id}", get(book_handler))
        .route("/api/muyu-helper/welcome", get(welcome_handler))
        .route("/api/generate-muyu-text", axum::routing::post(generate_handler))
        .route("/api/oauth/auth-url", get(oauth_auth_url_handler))
        .route("/api/oauth/callback", get(oauth_callback_handler))
        .route("/api/oauth/status", get(oauth_status_handler))
        .layer(TimeoutLayer::new(request_timeout));

    // SSE 连接可以比任何请求超时都长，上游由共享 HTTP 客户端的
    // connect/read 超时约束
    let streaming = Router::new()
        .route(
            "/api/muyu-helper/chat",
            get(chat_stream_handler).post(chat_handler),
        )
        .route(
            "/api/search-muyu",
            get(search_stream_handler).post(search_handler),
        );

    plain
        .merge(streaming)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> AppResult<()> {
    let app_state = AppState::new(config.clone())?;

    // 后台任务：定期清理过期的会话负载
    SessionStore::spawn_sweeper(app_state.sessions.clone(), Duration::from_secs(60));

    let app = create_app(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::ConfigError(format!("Failed to bind to {addr}: {e}")))?;

    tracing::info!("muyu-api server starting on {addr}");
    tracing::info!("Available endpoints:");
    tracing::info!("  GET  /api/health - Health check");
    tracing::info!("  GET  /api/muyu-catalog - Muyu shu catalog");
    tracing::info!("  GET  /api/muyu-book/:id - Single catalog entry");
    tracing::info!("  GET  /api/muyu-helper/welcome - Assistant greeting");
    tracing::info!("  POST /api/muyu-helper/chat - Assistant chat (SSE handoff)");
    tracing::info!("  POST /api/search-muyu - Catalog search (SSE handoff)");
    tracing::info!("  POST /api/generate-muyu-text - Story generation");
    tracing::info!("  GET  /api/oauth/* - OAuth authorization");

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::InternalServerError(format!("Server error: {e}")))?;

    Ok(())
}

// Request Handlers

#[derive(Deserialize, Debug, Default)]
struct StreamQuery {
    stream: Option<String>,
    session: Option<String>,
}

impl StreamQuery {
    fn wants_stream(&self) -> bool {
        self.stream.as_deref() == Some("true")
    }
}

/// Build the SSE response for a relay event sequence.
fn sse_response(rx: mpsc::Receiver<RelayEvent>) -> Response {
    let stream =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_sse_event()));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "木鱼书网站API服务正常运行",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn catalog_handler() -> Json<Value> {
    Json(json!({ "catalog": catalog::catalog() }))
}

async fn book_handler(Path(id): Path<String>) -> AppResult<Json<catalog::CatalogEntry>> {
    catalog::find_by_id(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("未找到指定的木鱼书".to_string()))
}

async fn welcome_handler() -> Json<Value> {
    Json(json!({ "message": catalog::welcome_message() }))
}

/// Parse and validate the chat message list from a raw request body.
fn parse_chat_messages(body: &Value) -> AppResult<Vec<ChatMessage>> {
    let messages = body
        .get("messages")
        .ok_or_else(|| AppError::invalid_payload("消息参数无效"))?;
    let messages: Vec<ChatMessage> = serde_json::from_value(messages.clone())
        .map_err(|_| AppError::invalid_payload("消息参数无效"))?;
    if messages.is_empty() {
        return Err(AppError::invalid_payload("消息参数无效"));
    }
    for message in &messages {
        message.validate().map_err(AppError::invalid_payload)?;
    }
    Ok(messages)
}

/// 与小木鱼助手对话 - POST请求接收消息
async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let messages = parse_chat_messages(&body)?;

    // 流式请求且带会话ID：暂存消息，等待EventSource连接
    if query.wants_stream() {
        if let Some(session) = query.session.as_deref().filter(|s| !s.is_empty()) {
            state
                .relay
                .accept_payload(session, SessionPayload::Chat(messages))
                .await;
            return Ok(Json(json!({ "status": "ok", "message": "消息已接收，等待SSE连接" }))
                .into_response());
        }
        // 兼容旧版本：无会话ID时直接在本次连接上流式输出
        let rx = state.relay.stream_payload(
            SessionPayload::Chat(messages),
            RelayRoute::Chat,
            state.chat.clone() as Arc<dyn StreamingUpstream>,
        );
        return Ok(sse_response(rx));
    }

    // 非流式输出模式
    match state.chat.chat(&messages).await {
        Ok(response) => Ok(Json(response).into_response()),
        Err(e) if state.config.runtime.demo_mode => {
            tracing::warn!("chat upstream failed, demo mode placeholder returned: {e}");
            Ok(Json(demo_chat_response()).into_response())
        }
        Err(e) => Err(e),
    }
}

/// 小木鱼助手流式输出 - GET请求处理EventSource连接
async fn chat_stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> AppResult<Response> {
    if !query.wants_stream() {
        return Err(AppError::invalid_payload("非流式请求应使用POST方法"));
    }
    let token = query.session.unwrap_or_default();
    let rx = state
        .relay
        .open_stream(
            &token,
            RelayRoute::Chat,
            state.chat.clone() as Arc<dyn StreamingUpstream>,
        )
        .await;
    Ok(sse_response(rx))
}

#[derive(Deserialize, Debug)]
struct SearchBody {
    query: Option<Value>,
}

fn parse_search_query(body: &SearchBody) -> AppResult<String> {
    match &body.query {
        Some(Value::String(q)) if !q.is_empty() => Ok(q.clone()),
        _ => Err(AppError::invalid_payload("查询参数无效")),
    }
}

/// 木鱼书检索 - POST请求接收查询
async fn search_handler(
    State(state): State<AppState>,
    Query(query_params): Query<StreamQuery>,
    Json(body): Json<SearchBody>,
) -> AppResult<Response> {
    let query = parse_search_query(&body)?;

    if query_params.wants_stream() {
        if let Some(session) = query_params.session.as_deref().filter(|s| !s.is_empty()) {
            state
                .relay
                .accept_payload(session, SessionPayload::Search(query))
                .await;
            return Ok(Json(json!({ "status": "ok", "message": "查询已接收，等待SSE连接" }))
                .into_response());
        }
        let rx = state.relay.stream_payload(
            SessionPayload::Search(query),
            RelayRoute::Search,
            state.retrieval.clone() as Arc<dyn StreamingUpstream>,
        );
        return Ok(sse_response(rx));
    }

    match state.retrieval.search(&query).await {
        Ok(response) => Ok(Json(response).into_response()),
        Err(e) if state.config.runtime.demo_mode => {
            tracing::warn!("search upstream failed, demo mode placeholder returned: {e}");
            Ok(Json(demo_search_response(&query)).into_response())
        }
        Err(e) => Err(e),
    }
}

/// 木鱼书检索流式输出 - GET请求处理EventSource连接
async fn search_stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> AppResult<Response> {
    if !query.wants_stream() {
        return Err(AppError::invalid_payload("非流式请求应使用POST方法"));
    }
    let token = query.session.unwrap_or_default();
    let rx = state
        .relay
        .open_stream(
            &token,
            RelayRoute::Search,
            state.retrieval.clone() as Arc<dyn StreamingUpstream>,
        )
        .await;
    Ok(sse_response(rx))
}

#[derive(Deserialize, Debug)]
struct GenerateBody {
    keywords: Option<Vec<Keyword>>,
}

/// 代理工作流API请求 - 生成四段式木鱼书故事
async fn generate_handler(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> AppResult<Json<GeneratedStory>> {
    let keywords = body
        .keywords
        .filter(|k| !k.is_empty() && k.iter().all(|kw| !kw.name.is_empty()))
        .ok_or_else(|| AppError::invalid_payload("关键词参数无效"))?;

    match state.workflow.generate(&keywords).await {
        Ok(story) => Ok(Json(story)),
        Err(e) if state.config.runtime.demo_mode => {
            tracing::warn!("workflow upstream failed, demo mode placeholder returned: {e}");
            Ok(Json(demo_story(&keywords)))
        }
        Err(e) => Err(e),
    }
}

// OAuth授权相关路由

async fn oauth_auth_url_handler(State(state): State<AppState>) -> Json<Value> {
    let auth_url = state.credentials.auth_url().await;
    Json(json!({ "authUrl": auth_url }))
}

#[derive(Deserialize, Debug)]
struct CallbackQuery {
    code: Option<String>,
}

async fn oauth_callback_handler(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> AppResult<Html<&'static str>> {
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::invalid_payload("授权码缺失"))?;

    state.credentials.exchange_code(&code).await?;

    Ok(Html(
        "<html><head><title>授权成功</title></head><body>\
         <h1>授权成功！</h1><p>您已成功授权木鱼书应用。现在可以关闭此窗口并返回应用。</p>\
         </body></html>",
    ))
}

async fn oauth_status_handler(State(state): State<AppState>) -> Json<Value> {
    let status = state.credentials.status().await;
    Json(json!({
        "authenticated": status.authenticated,
        "expires_at": status.expires_at,
    }))
}

// 宽松模式占位数据：始终以 DEMO_MARKER 开头，与真实上游结果区分

fn demo_chat_response() -> Value {
    json!({
        "id": "demo-response-id",
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": "demo",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!(
                    "{DEMO_MARKER}木鱼书是广东地区的传统说唱艺术形式，\
                     具有悠久的历史和独特的艺术特色。"
                ),
            },
            "finish_reason": "stop"
        }]
    })
}

fn demo_search_response(query: &str) -> Value {
    json!({
        "marker": DEMO_MARKER,
        "query": query,
        "results": [
            { "title": "花笺记", "description": "经典木鱼书爱情故事", "category": "爱情故事" },
            { "title": "二荷花史", "description": "历史题材木鱼书", "category": "历史传说" }
        ]
    })
}

fn demo_story(keywords: &[Keyword]) -> GeneratedStory {
    let joined = keywords
        .iter()
        .map(|k| k.name.as_str())
        .collect::<Vec<_>>()
        .join("，");
    GeneratedStory {
        text: format!(
            "{DEMO_MARKER}基于关键词「{joined}」生成的木鱼书文本：\
             花开花落，岁月如梭。愿君如花之清雅，坚韧不拔。"
        ),
        images: Vec::new(),
        story_parts: Vec::new(),
    }
}
