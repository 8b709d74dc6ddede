use multi_uploader::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    server::{build_router, AppState},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 配置文件不存在或解析失败时使用默认配置
    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Multi Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(&config.receiver).await?;
    info!("分片存储目录: {:?}", state.store.dir());
    if let Some(header) = state.required_header.as_deref() {
        info!("上传分片需要携带请求头: {}", header);
    }

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let app = build_router(state).layer(middleware);

    let addr = config.receiver.bind_addr();
    info!("接收端启动在: http://{}", addr);
    info!("分片上传: POST http://{}/upload", addr);
    info!("合并分片: POST http://{}/upload/merge", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，正在退出...");
        }
    }

    info!("接收端已退出");
    Ok(())
}
