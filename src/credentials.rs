use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{config::OAuthConfig, errors::AppError};

/// 授权会话有效期：10分钟
const PENDING_AUTH_TTL_MS: i64 = 10 * 60 * 1000;
/// Token 提前刷新窗口：5分钟，避免边界情况
const EXPIRY_MARGIN_MS: i64 = 5 * 60 * 1000;

/// Persisted OAuth token data
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Unix 毫秒时间戳，保存时根据 expires_in 计算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl TokenData {
    /// 检查Token是否过期（提前5分钟视为过期）
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now().timestamp_millis() > expires_at - EXPIRY_MARGIN_MS,
            None => true,
        }
    }
}

/// Public view of the authentication status
#[derive(Serialize, Debug)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub expires_at: Option<i64>,
}

#[derive(Debug)]
struct PendingAuth {
    code_verifier: String,
    created_at: i64,
}

/// Owns the OAuth bearer credential for the workflow provider.
///
/// Callers only ever see a fully-formed authorization header string; the
/// token itself never leaves this module. The cached token and the pending
/// PKCE verifier are both mutex-guarded so refreshes stay serialized.
pub struct CredentialProvider {
    config: OAuthConfig,
    client: Client,
    token_path: PathBuf,
    cached: Mutex<Option<TokenData>>,
    pending_auth: Mutex<Option<PendingAuth>>,
}

impl CredentialProvider {
    pub fn new(config: OAuthConfig, client: Client) -> Self {
        let token_path = PathBuf::from(&config.token_file);
        Self {
            config,
            client,
            token_path,
            cached: Mutex::new(None),
            pending_auth: Mutex::new(None),
        }
    }

    /// 生成授权URL（PKCE S256），并暂存 code_verifier 供回调使用
    pub async fn auth_url(&self) -> String {
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);

        let auth_url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state=random_state&\
             code_challenge={}&code_challenge_method=S256",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            code_challenge,
        );

        let mut pending = self.pending_auth.lock().await;
        *pending = Some(PendingAuth {
            code_verifier,
            created_at: Utc::now().timestamp_millis(),
        });

        auth_url
    }

    /// 使用授权码换取 access_token 和 refresh_token
    pub async fn exchange_code(&self, code: &str) -> Result<(), AppError> {
        let verifier = {
            let mut pending = self.pending_auth.lock().await;
            let Some(auth) = pending.take() else {
                return Err(AppError::invalid_payload(
                    "授权会话不存在，请重新开始授权流程",
                ));
            };
            if Utc::now().timestamp_millis() - auth.created_at > PENDING_AUTH_TTL_MS {
                return Err(AppError::invalid_payload(
                    "授权会话已过期，请重新开始授权流程",
                ));
            }
            auth.code_verifier
        };

        let body = json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": self.config.redirect_uri,
            "client_id": self.config.client_id,
            "code_verifier": verifier,
        });

        let token = self.request_token(body).await?;
        self.save_token(token).await?;
        tracing::info!("obtained new access token via authorization code");
        Ok(())
    }

    /// 当前认证状态（基于持久化的Token）
    pub async fn status(&self) -> AuthStatus {
        match self.load_token().await {
            Ok(Some(token)) => AuthStatus {
                authenticated: !token.is_expired(),
                expires_at: token.expires_at,
            },
            _ => AuthStatus {
                authenticated: false,
                expires_at: None,
            },
        }
    }

    /// 获取用于API请求的授权头。
    ///
    /// 优先使用OAuth Token（过期时用 refresh_token 刷新），
    /// 失败则回退到配置的静态 API Key。
    pub async fn authorization_header(&self) -> Result<String, AppError> {
        match self.valid_access_token().await {
            Ok(token) => Ok(format!("Bearer {token}")),
            Err(e) => {
                tracing::warn!("OAuth token unavailable, falling back to API key: {e}");
                match &self.config.api_key {
                    Some(key) if !key.is_empty() => Ok(format!("Bearer {key}")),
                    _ => Err(AppError::CredentialUnavailable(
                        "no valid OAuth token and no fallback API key configured".to_string(),
                    )),
                }
            }
        }
    }

    /// 获取有效的 access_token，必要时刷新。刷新在缓存锁内进行，
    /// 保证同一时刻至多一个刷新请求在途。
    async fn valid_access_token(&self) -> Result<String, AppError> {
        let mut cached = self.cached.lock().await;

        if cached.is_none() {
            *cached = self.load_token().await?;
        }

        let Some(token) = cached.as_ref() else {
            return Err(AppError::CredentialUnavailable(
                "no token on disk, authorization required".to_string(),
            ));
        };

        if !token.is_expired() {
            return Ok(token.access_token.clone());
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            return Err(AppError::CredentialUnavailable(
                "access token expired and no refresh token available".to_string(),
            ));
        };

        tracing::info!("access token expired, refreshing");
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.config.client_id,
        });
        let new_token = self.request_token(body).await?;
        let access_token = new_token.access_token.clone();
        self.persist_token(&new_token).await?;
        *cached = Some(new_token);
        Ok(access_token)
    }

    async fn request_token(&self, body: serde_json::Value) -> Result<TokenData, AppError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AppError::CredentialUnavailable(format!("token endpoint unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::CredentialUnavailable(format!(
                "token endpoint returned {status}: {text}"
            )));
        }

        let mut token: TokenData = response.json().await.map_err(|e| {
            AppError::CredentialUnavailable(format!("failed to parse token response: {e}"))
        })?;

        if let Some(expires_in) = token.expires_in {
            token.expires_at = Some(Utc::now().timestamp_millis() + expires_in * 1000);
        }
        Ok(token)
    }

    async fn save_token(&self, token: TokenData) -> Result<(), AppError> {
        self.persist_token(&token).await?;
        let mut cached = self.cached.lock().await;
        *cached = Some(token);
        Ok(())
    }

    async fn persist_token(&self, token: &TokenData) -> Result<(), AppError> {
        let data = serde_json::to_string_pretty(token)
            .map_err(|e| AppError::internal(format!("failed to serialize token: {e}")))?;
        tokio::fs::write(&self.token_path, data)
            .await
            .map_err(|e| AppError::internal(format!("failed to persist token: {e}")))?;
        tracing::debug!(path = %self.token_path.display(), "token persisted");
        Ok(())
    }

    async fn load_token(&self) -> Result<Option<TokenData>, AppError> {
        match tokio::fs::read_to_string(&self.token_path).await {
            Ok(data) => serde_json::from_str(&data).map(Some).map_err(|e| {
                AppError::internal(format!("failed to parse persisted token: {e}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::internal(format!("failed to read token file: {e}"))),
        }
    }
}

/// 生成随机的 code_verifier（URL安全字符，43-128位）
fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 根据 code_verifier 生成 S256 code_challenge
fn generate_code_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
