pub mod config;
pub mod dispatch;
pub mod error;
pub mod flows;
pub mod gemini;
pub mod keypool;
pub mod logging;
pub mod models;
pub mod usage;
pub mod util;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let pool = Arc::new(keypool::KeyPool::new(&cfg.gemini_api_keys));
    if pool.is_empty() {
        tracing::warn!("未配置 GEMINI_API_KEYS，所有生成请求都会直接失败");
    } else {
        tracing::info!("已加载 {} 把 API Key", pool.len());
    }

    let backend =
        Arc::new(gemini::client::GeminiClient::new(&cfg).context("初始化上游客户端失败")?);
    let store = usage::build_store(&cfg).context("初始化用量存储失败")?;
    let tracker = usage::UsageTracker::new(&cfg, store);
    let table = models::ModelTable::from_config(&cfg);
    let dispatcher = dispatch::Dispatcher::new(backend, pool.clone(), table, tracker);

    let state = Arc::new(flows::AppState {
        cfg: cfg.clone(),
        pool,
        dispatcher,
    });

    // === 公开路由 ===
    let public_routes = Router::new().route("/health", get(handle_health));

    // === API 路由（每个生成流程一个端点）===
    let api_routes = Router::new()
        .route("/api/quiz/custom", post(flows::quiz::handle_custom_quiz))
        .route(
            "/api/quiz/document",
            post(flows::quiz::handle_document_quiz),
        )
        .route(
            "/api/flashcards",
            post(flows::flashcards::handle_flashcards),
        )
        .route(
            "/api/study-guide",
            post(flows::study_guide::handle_study_guide),
        )
        .route("/api/explain", post(flows::explain::handle_explain))
        .route(
            "/api/explain/image",
            post(flows::explain::handle_image_explain),
        )
        .route("/api/helpbot", post(flows::helpbot::handle_helpbot))
        .route("/api/pool/status", get(flows::handle_pool_status))
        .with_state(state);

    let app = Router::new().merge(public_routes).merge(api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG 档位打开时连带放开本项目的 debug 日志（派发层的逐次尝试记录）。
    // 默认把依赖库日志控制在 warn（避免噪声），本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把关键日志过滤掉。
    let own_level = if cfg.log_level().client_enabled() {
        "debug"
    } else {
        "info"
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new(format!("warn,quizforge={own_level}"))
    } else if env.contains("quizforge") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},quizforge={own_level}"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
