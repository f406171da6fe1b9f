//! 书签同步守护进程入口
//!
//! 一台机器一个守护进程：对上维持到同步服务端的单条重连 WebSocket，
//! 对下在 localhost 监听浏览器助手进程的长度前缀流连接。

mod context;
mod cursor;
mod downlink;
mod host;
mod uplink;

use std::path::PathBuf;
use std::sync::Arc;

use context::DaemonContext;
use marksync::{ClientConfig, MarksyncError};
use tokio::net::TcpListener;

fn config_from_env() -> Result<(ClientConfig, String), MarksyncError> {
    let require = |key: &str| {
        std::env::var(key)
            .map_err(|_| MarksyncError::Config(format!("缺少环境变量 {}", key)))
    };
    let config = ClientConfig {
        server_url: std::env::var("MARKSYNC_SERVER_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8787/ws".to_string()),
        token: std::env::var("MARKSYNC_TOKEN").unwrap_or_default(),
        user_id: require("MARKSYNC_USER_ID")?,
        device_id: require("MARKSYNC_DEVICE_ID")?,
        browser_type: std::env::var("MARKSYNC_BROWSER").unwrap_or_else(|_| "chrome".to_string()),
        device_name: std::env::var("MARKSYNC_DEVICE_NAME").ok(),
        data_dir: std::env::var("MARKSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./marksync-data")),
        ..Default::default()
    };
    let listen_addr =
        std::env::var("MARKSYNC_LISTEN").unwrap_or_else(|_| "127.0.0.1:8710".to_string());
    Ok((config, listen_addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("marksync_daemon=info".parse().expect("有效的日志指令"))
                .add_directive("marksync=info".parse().expect("有效的日志指令")),
        )
        .init();

    let (config, listen_addr) = config_from_env()?;
    tracing::info!(
        "🚀 marksync-daemon 启动: server={}, device={}, listen={}",
        config.server_url,
        config.device_id,
        listen_addr
    );

    let ctx = Arc::new(DaemonContext::new(config)?);

    // 上行：重连客户端 + 事件消费
    let client_task = ctx.client.start();
    let events_task = tokio::spawn(downlink::run(Arc::clone(&ctx)));

    // 下行：本机助手监听
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!("助手接口监听中: {}", listen_addr);
    let host_task = tokio::spawn(host::serve(Arc::clone(&ctx), listener));

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，开始关停");
    ctx.client.shutdown();
    host_task.abort();
    let _ = client_task.await;
    let _ = events_task.await;
    Ok(())
}
