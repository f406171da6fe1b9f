//! 客户端配置

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MarksyncError, Result};

/// 重连策略配置
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// 首次重连前的基础等待
    pub base_delay: Duration,
    /// 指数退避的等待上限
    pub max_delay: Duration,
    /// 放弃前的最大重连次数
    pub max_attempts: u32,
    /// 抖动比例（0.0 - 1.0），在退避值上叠加随机量防止惊群
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter_ratio: 0.3,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 服务端 WebSocket 地址，如 ws://host:port/ws
    pub server_url: String,
    /// 鉴权令牌
    pub token: String,
    /// 用户 ID
    pub user_id: String,
    /// 本设备 ID
    pub device_id: String,
    /// 浏览器标识
    pub browser_type: String,
    /// 设备展示名
    pub device_name: Option<String>,
    /// 本地数据目录（游标等持久状态）
    pub data_dir: PathBuf,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 单次连接建立的超时
    pub connect_timeout: Duration,
    /// 重连策略
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8787/ws".to_string(),
            token: String::new(),
            user_id: String::new(),
            device_id: String::new(),
            browser_type: "chrome".to_string(),
            device_name: None,
            data_dir: PathBuf::from("./marksync-data"),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// 校验配置完整性
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(MarksyncError::Config("server_url 不能为空".to_string()));
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(MarksyncError::Config(format!(
                "server_url 必须以 ws:// 或 wss:// 开头: {}",
                self.server_url
            )));
        }
        if self.user_id.is_empty() {
            return Err(MarksyncError::Config("user_id 不能为空".to_string()));
        }
        if self.device_id.is_empty() {
            return Err(MarksyncError::Config("device_id 不能为空".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(MarksyncError::Config(
                "jitter_ratio 必须在 0.0 到 1.0 之间".to_string(),
            ));
        }
        Ok(())
    }
}
