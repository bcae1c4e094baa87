use clap::Parser;
use muyu_api::{AppError, load_config, start_server};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 木鱼书网站后端服务
#[derive(Parser, Debug)]
#[command(name = "muyu-api", version, about = "Muyu shu heritage site backend")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// 主函数 - 木鱼书后端服务的入口点
///
/// 负责初始化日志系统、加载配置并启动HTTP服务器
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // 加载配置文件和环境变量配置
    let config = load_config(&cli.config)
        .map_err(|e| AppError::ConfigError(format!("加载配置失败: {e}")))?;

    init_tracing(&config.logging.level, &config.logging.format)?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        demo_mode = config.runtime.demo_mode,
        "Configuration loaded successfully"
    );

    start_server(config).await?;

    Ok(())
}

/// 初始化结构化日志系统
///
/// 环境变量 RUST_LOG 优先，否则使用配置文件中的日志级别；
/// 输出格式（compact/pretty/json）由配置决定。
fn init_tracing(level: &str, format: &str) -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("muyu_api={level},tower_http=debug")));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        "json" => registry.with(fmt::layer().with_target(true).json()).try_init(),
        "pretty" => registry.with(fmt::layer().with_target(true).pretty()).try_init(),
        _ => registry.with(fmt::layer().with_target(false).compact()).try_init(),
    };

    result.map_err(|e| AppError::ConfigError(format!("Failed to initialize tracing: {e}")))
}
