//! 客户端事件总线
//!
//! 连接状态变迁与入站消息通过 broadcast 通道对外广播，守护进程和
//! 上层 UI 各自订阅，互不阻塞。

use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::ServerMessage;

/// 客户端生命周期事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// 连接建立（含重连成功）
    Connected,
    /// 连接断开
    Disconnected,
    /// 准备第 attempt 次重连，将等待 delay_ms 毫秒
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// 重连次数耗尽，放弃
    GaveUp { attempts: u32 },
    /// 收到服务端消息
    MessageReceived(ServerMessage),
    /// 非致命错误（连接仍由重连循环接管）
    Error(String),
}

/// 事件总线
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// 发布事件（无订阅者时静默丢弃）
    pub fn publish(&self, event: ClientEvent) {
        let receivers = self.sender.receiver_count();
        if receivers == 0 {
            debug!("事件无订阅者，丢弃: {:?}", event);
            return;
        }
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
