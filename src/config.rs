use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

/// 主配置结构体
///
/// 包含木鱼书网站后端的所有配置信息，从配置文件和环境变量加载，
/// 启动时解析一次，之后以 Arc 共享、只读。
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// 服务器配置
    pub server: ServerConfig,
    /// 上游 AI 提供商配置
    pub providers: ProvidersConfig,
    /// 流式中继配置（可选，有默认值）
    #[serde(default)]
    pub relay: RelayConfig,
    /// OAuth 凭据配置
    pub oauth: OAuthConfig,
    /// 运行时模式（可选，有默认值）
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// 日志配置（可选，有默认值）
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// 三个上游提供商：对话、检索、工作流
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProvidersConfig {
    pub chat: ChatProviderConfig,
    pub retrieval: RetrievalProviderConfig,
    pub workflow: WorkflowProviderConfig,
}

/// 对话补全 API（OpenAI 风格）
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChatProviderConfig {
    pub api_key: String,
    pub api_base: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
}

/// 检索智能体 API（bot 会话接口）
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetrievalProviderConfig {
    pub api_key: String,
    pub api_base: String,
    pub bot_id: String,
}

/// 工作流 API（授权头由凭据提供器构造）
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WorkflowProviderConfig {
    pub api_base: String,
    pub workflow_id: String,
    pub app_id: String,
}

/// 流式中继配置：会话 TTL、上游超时、思考/结果分界线
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,
    #[serde(default = "default_result_delimiter")]
    pub result_delimiter: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_token_file")]
    pub token_file: String,
    /// 静态 API Key 回退，OAuth 令牌不可用时使用
    #[serde(default)]
    pub api_key: Option<String>,
}

/// 运行时模式配置
///
/// `demo_mode` 为 true 时处于宽松模式：上游调用失败后各处理器
/// 返回带 `【演示数据】` 标记的确定性占位数据，而不是报错。
/// 默认关闭，默认模式下错误始终原样上抛。
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub demo_mode: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_chat_model() -> String {
    "deepseek-chat".to_string()
}
fn default_session_ttl() -> u64 {
    300
}
fn default_upstream_timeout() -> u64 {
    30
}
fn default_result_delimiter() -> String {
    "##################".to_string()
}
fn default_auth_url() -> String {
    "https://www.coze.cn/api/permission/oauth2/authorize".to_string()
}
fn default_token_url() -> String {
    "https://api.coze.cn/api/permission/oauth2/token".to_string()
}
fn default_token_file() -> String {
    ".token.json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            upstream_timeout_seconds: default_upstream_timeout(),
            result_delimiter: default_result_delimiter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// 加载配置文件和环境变量
///
/// 从指定的 TOML 文件和环境变量（前缀 MUYU_API_）加载配置，
/// 环境变量会覆盖配置文件中的相同设置，加载后立即验证。
pub fn load_config(path: &str) -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("MUYU_API_").split("__"))
        .extract()
        .context("Failed to load configuration from config file or environment variables")?;

    config.validate().context("Configuration validation failed")?;

    Ok(config)
}

impl Config {
    /// 验证整个配置的有效性
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .context("Server configuration validation failed")?;
        self.providers
            .validate()
            .context("Provider configuration validation failed")?;
        self.relay
            .validate()
            .context("Relay configuration validation failed")?;
        self.oauth
            .validate()
            .context("OAuth configuration validation failed")?;
        self.logging
            .validate()
            .context("Logging configuration validation failed")?;
        Ok(())
    }
}

fn validate_api_base(api_base: &str) -> Result<()> {
    if api_base.is_empty() {
        return Err(anyhow::anyhow!("API base URL cannot be empty"));
    }
    if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
        return Err(anyhow::anyhow!(
            "API base URL must start with http:// or https://"
        ));
    }
    Ok(())
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.request_timeout_seconds == 0 || self.request_timeout_seconds > 300 {
            return Err(anyhow::anyhow!(
                "Request timeout must be between 1 and 300 seconds"
            ));
        }
        Ok(())
    }
}

impl ProvidersConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chat.api_key.is_empty() {
            return Err(anyhow::anyhow!("Chat provider API key cannot be empty"));
        }
        validate_api_base(&self.chat.api_base).context("chat provider")?;
        if self.chat.model.is_empty() {
            return Err(anyhow::anyhow!("Chat provider model cannot be empty"));
        }

        if self.retrieval.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "Retrieval provider API key cannot be empty"
            ));
        }
        validate_api_base(&self.retrieval.api_base).context("retrieval provider")?;
        if self.retrieval.bot_id.is_empty() {
            return Err(anyhow::anyhow!("Retrieval provider bot_id cannot be empty"));
        }

        validate_api_base(&self.workflow.api_base).context("workflow provider")?;
        if self.workflow.workflow_id.is_empty() {
            return Err(anyhow::anyhow!(
                "Workflow provider workflow_id cannot be empty"
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_seconds == 0 || self.session_ttl_seconds > 3600 {
            return Err(anyhow::anyhow!(
                "Session TTL must be between 1 and 3600 seconds"
            ));
        }
        if self.upstream_timeout_seconds == 0 || self.upstream_timeout_seconds > 600 {
            return Err(anyhow::anyhow!(
                "Upstream timeout must be between 1 and 600 seconds"
            ));
        }
        if self.result_delimiter.is_empty() {
            return Err(anyhow::anyhow!("Result delimiter cannot be empty"));
        }
        Ok(())
    }
}

impl OAuthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(anyhow::anyhow!("OAuth client_id cannot be empty"));
        }
        if self.redirect_uri.is_empty() {
            return Err(anyhow::anyhow!("OAuth redirect_uri cannot be empty"));
        }
        validate_api_base(&self.auth_url).context("oauth auth_url")?;
        validate_api_base(&self.token_url).context("oauth token_url")?;
        if self.token_file.is_empty() {
            return Err(anyhow::anyhow!("OAuth token_file cannot be empty"));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}': must be one of {:?}",
                self.level,
                valid_levels
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}': must be one of {:?}",
                self.format,
                valid_formats
            ));
        }

        Ok(())
    }
}
