use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use muyu_api::config::{
    ChatProviderConfig, Config, LoggingConfig, OAuthConfig, ProvidersConfig, RelayConfig,
    RetrievalProviderConfig, RuntimeConfig, ServerConfig, WorkflowProviderConfig,
};
use muyu_api::server::{AppState, DEMO_MARKER, create_app};
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout_seconds: 30,
        },
        providers: ProvidersConfig {
            chat: ChatProviderConfig {
                api_key: "test-chat-key-1234567890".to_string(),
                // 不可达端口：上游调用立即失败
                api_base: "http://127.0.0.1:9".to_string(),
                model: "deepseek-chat".to_string(),
            },
            retrieval: RetrievalProviderConfig {
                api_key: "test-search-key-1234567890".to_string(),
                api_base: "http://127.0.0.1:9".to_string(),
                bot_id: "test-bot".to_string(),
            },
            workflow: WorkflowProviderConfig {
                api_base: "http://127.0.0.1:9".to_string(),
                workflow_id: "wf-1".to_string(),
                app_id: "app-1".to_string(),
            },
        },
        relay: RelayConfig::default(),
        oauth: OAuthConfig {
            client_id: "client-1".to_string(),
            redirect_uri: "http://localhost:5001/api/oauth/callback".to_string(),
            auth_url: "https://auth.example.com/oauth2/authorize".to_string(),
            token_url: "https://auth.example.com/oauth2/token".to_string(),
            token_file: "/nonexistent/muyu-test-token.json".to_string(),
            api_key: None,
        },
        runtime: RuntimeConfig { demo_mode: false },
        logging: LoggingConfig::default(),
    }
}

fn app(config: Config) -> Router {
    let state = AppState::new(config).expect("app state");
    create_app(state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8_lossy(&bytes).to_string()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let response = app(test_config()).oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn catalog_lists_fixed_entries() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-catalog"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let catalog = body["catalog"].as_array().expect("catalog array");
    assert!(!catalog.is_empty());
    assert!(catalog.iter().any(|e| e["title"] == "花笺记"));
}

#[tokio::test]
async fn book_lookup_by_id() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-book/1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["title"], "花笺记");
}

#[tokio::test]
async fn unknown_book_is_404() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-book/999"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().is_some());
}

#[tokio::test]
async fn welcome_returns_greeting() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-helper/welcome"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("木鱼书"));
}

#[tokio::test]
async fn chat_post_without_messages_is_400() {
    let response = app(test_config())
        .oneshot(post_json("/api/muyu-helper/chat", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_post_with_wrong_message_shape_is_400() {
    let response = app(test_config())
        .oneshot(post_json(
            "/api/muyu-helper/chat",
            json!({ "messages": "not an array" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_post_with_invalid_role_is_400() {
    let response = app(test_config())
        .oneshot(post_json(
            "/api/muyu-helper/chat",
            json!({ "messages": [{ "role": "robot", "content": "hi" }] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_post_without_query_is_400() {
    let response = app(test_config())
        .oneshot(post_json("/api/search-muyu", json!({ "query": 123 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generate_without_keywords_is_400() {
    let response = app(test_config())
        .oneshot(post_json("/api/generate-muyu-text", json!({ "keywords": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Streaming handoff: the POST parks the payload and answers immediately.
#[tokio::test]
async fn streaming_post_acknowledges_handoff() {
    let response = app(test_config())
        .oneshot(post_json(
            "/api/search-muyu?stream=true&session=abc",
            json!({ "query": "花笺记" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn stream_get_without_stream_param_is_400() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-helper/chat?session=abc"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// GET with an unknown session token: one error event, then the stream closes.
#[tokio::test]
async fn stream_get_with_unknown_session_emits_error_event() {
    let response = app(test_config())
        .oneshot(get("/api/search-muyu?stream=true&session=nonexistent"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let body = body_string(response).await;
    assert!(body.contains("event: error"));
    assert!(body.contains("会话"));
    assert_eq!(body.matches("event:").count(), 1);
}

#[tokio::test]
async fn stream_get_without_session_emits_error_event() {
    let response = app(test_config())
        .oneshot(get("/api/muyu-helper/chat?stream=true"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    assert!(body.contains("event: error"));
}

/// In default mode an unreachable upstream propagates as an error status.
#[tokio::test]
async fn default_mode_surfaces_upstream_failure() {
    let response = app(test_config())
        .oneshot(post_json(
            "/api/generate-muyu-text",
            json!({ "keywords": [{ "name": "梅花" }] }),
        ))
        .await
        .unwrap();
    assert!(response.status().is_server_error() || response.status() == StatusCode::BAD_GATEWAY);
}

/// Demo mode: a failing upstream yields deterministic placeholder data
/// carrying the documented marker and the submitted keywords.
#[tokio::test]
async fn demo_mode_substitutes_placeholder_story() {
    let mut config = test_config();
    config.runtime.demo_mode = true;

    let response = app(config)
        .oneshot(post_json(
            "/api/generate-muyu-text",
            json!({ "keywords": [{ "name": "梅花" }, { "name": "竹子" }] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let text = body["text"].as_str().unwrap();
    assert!(text.starts_with(DEMO_MARKER));
    assert!(text.contains("梅花"));
    assert!(text.contains("竹子"));
}

#[tokio::test]
async fn demo_mode_substitutes_placeholder_chat() {
    let mut config = test_config();
    config.runtime.demo_mode = true;

    let response = app(config)
        .oneshot(post_json(
            "/api/muyu-helper/chat",
            json!({ "messages": [{ "role": "user", "content": "你好" }] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.starts_with(DEMO_MARKER));
}

#[tokio::test]
async fn oauth_status_unauthenticated_without_token() {
    let response = app(test_config())
        .oneshot(get("/api/oauth/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["authenticated"], false);
}

#[tokio::test]
async fn oauth_auth_url_contains_pkce_challenge() {
    let response = app(test_config())
        .oneshot(get("/api/oauth/auth-url"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let url = body["authUrl"].as_str().unwrap();
    assert!(url.contains("code_challenge="));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("client_id=client-1"));
}

#[tokio::test]
async fn oauth_auth_url_percent_encodes_query_values() {
    let response = app(test_config())
        .oneshot(get("/api/oauth/auth-url"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let url = body["authUrl"].as_str().unwrap();
    assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A5001%2Fapi%2Foauth%2Fcallback"));
    assert!(!url.contains("redirect_uri=http://"));
}

#[tokio::test]
async fn oauth_callback_without_code_is_400() {
    let response = app(test_config())
        .oneshot(get("/api/oauth/callback"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
