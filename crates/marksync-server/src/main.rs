//! 书签同步服务端入口

mod error;
mod flow;
mod routes;
mod state;
mod ws;

use std::sync::Arc;

use state::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("marksync_server=info".parse().expect("有效的日志指令"))
                .add_directive("marksync=info".parse().expect("有效的日志指令")),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    tracing::info!(
        "🚀 marksync-server 启动: bind={}, db={}, auth={}",
        config.bind_addr,
        config.db_path,
        if config.token.is_some() { "令牌" } else { "关闭" }
    );

    let state = AppState::from_config(Arc::clone(&config))?;
    let router = routes::app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("监听中: {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，开始优雅关停");
}
