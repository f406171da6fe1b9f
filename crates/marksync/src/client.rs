//! 自动重连客户端
//!
//! 维护到服务端的单条 WebSocket 连接，断开后指数退避重连（带抖动），
//! 次数耗尽则放弃。状态变迁与入站消息经 [`EventBus`] 对外广播。
//!
//! 状态机：Disconnected -> Connecting -> Connected -> Reconnecting
//! -> (Connected | GaveUp)。处于非 Connected 状态时发送直接报错，
//! 排队补发由上层（守护进程的本地队列）负责。

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::{MarksyncError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::protocol::{ClientMessage, ServerMessage};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 计算第 attempt 次重连前的等待（attempt 从 1 开始）
///
/// 退避值 = min(base * 2^(attempt-1), max)，再叠加 [0, 退避值*jitter]
/// 的随机抖动，避免多设备同时掉线后齐刷刷回连。
fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let backoff = config
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_delay);
    let jitter_cap = backoff.as_millis() as f64 * config.jitter_ratio;
    let jitter = if jitter_cap > 0.0 {
        rand::thread_rng().gen_range(0.0..jitter_cap)
    } else {
        0.0
    };
    backoff + Duration::from_millis(jitter as u64)
}

/// 自动重连 WebSocket 客户端
pub struct ReconnectingClient {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    events: Arc<EventBus>,
    /// 当前连接的出站通道，断开期间为 None
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>>,
    cancel: CancellationToken,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events: Arc::new(EventBus::default()),
            outbound: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// 带鉴权参数的连接地址
    fn connect_url(&self) -> String {
        format!(
            "{}?token={}&userId={}&deviceId={}&browserType={}",
            self.config.server_url,
            self.config.token,
            self.config.user_id,
            self.config.device_id,
            self.config.browser_type,
        )
    }

    /// 发送消息，未连接时报 NotConnected
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if *self.state.read() != ConnectionState::Connected {
            return Err(MarksyncError::NotConnected);
        }
        let outbound = self.outbound.read();
        match outbound.as_ref() {
            Some(tx) if tx.send(message).is_ok() => Ok(()),
            _ => Err(MarksyncError::NotConnected),
        }
    }

    /// 请求停止重连循环并关闭连接
    pub fn shutdown(&self) {
        info!("客户端关停");
        self.cancel.cancel();
    }

    /// 启动连接与重连循环（后台任务，shutdown 或放弃后退出）
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run().await;
        })
    }

    async fn run(&self) {
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            match self.connect_and_serve().await {
                Ok(()) => {
                    // 连接曾成功建立并正常服务过，计数归零
                    attempts = 0;
                    self.events.publish(ClientEvent::Disconnected);
                }
                Err(e) => {
                    warn!("连接失败: {}", e);
                    self.events.publish(ClientEvent::Error(e.to_string()));
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            attempts += 1;
            if attempts > self.config.reconnect.max_attempts {
                error!("重连次数耗尽，放弃: attempts={}", attempts - 1);
                self.events.publish(ClientEvent::GaveUp {
                    attempts: attempts - 1,
                });
                break;
            }

            let delay = reconnect_delay(&self.config.reconnect, attempts);
            info!(
                "第 {} 次重连，等待 {}ms",
                attempts,
                delay.as_millis()
            );
            self.set_state(ConnectionState::Reconnecting);
            self.events.publish(ClientEvent::Reconnecting {
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        *self.outbound.write() = None;
    }

    /// 建连并服务到连接断开；返回 Ok 表示曾正常服务，Err 表示建连失败
    async fn connect_and_serve(&self) -> Result<()> {
        let url = self.connect_url();
        let (ws, _) = timeout(self.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| MarksyncError::Timeout("连接超时".to_string()))?
            .map_err(|e| MarksyncError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        *self.outbound.write() = Some(tx);
        self.set_state(ConnectionState::Connected);
        info!("连接建立: url={}", self.config.server_url);
        self.events.publish(ClientEvent::Connected);

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // 首次 tick 立即返回，跳过

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    let text = serde_json::to_string(&ClientMessage::Ping)?;
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(msg) = rx.recv() => {
                    let text = serde_json::to_string(&msg)?;
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("服务端关闭连接");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("连接读取出错: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        *self.outbound.write() = None;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => {
                debug!("收到服务端消息: {:?}", message);
                self.events.publish(ClientEvent::MessageReceived(message));
            }
            Err(e) => {
                warn!("服务端消息解析失败: {}, raw={}", e, text);
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!("连接状态变迁: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}
