//! 服务端事件消费
//!
//! 订阅重连客户端的事件流：连接建立时注册设备并携游标对账，收到
//! 增量时过滤回声、推进游标、扇出给本机助手连接。

use std::sync::Arc;

use marksync::types::PersistedOperation;
use marksync::{ClientEvent, ClientMessage, DeduplicationManager, HostReply, ServerMessage};
use tracing::{info, warn};

use crate::context::DaemonContext;

/// 过滤回声：剔除本机发出的操作与已见过的操作 id
///
/// 双重判据：source_device_id 覆盖经服务端落库后回流的本机操作，
/// 去重缓存覆盖设备 id 配置漂移后的残留记录。
pub fn filter_echo(
    own_device_id: &str,
    dedup: &DeduplicationManager,
    operations: Vec<PersistedOperation>,
) -> Vec<PersistedOperation> {
    operations
        .into_iter()
        .filter(|p| p.op.source_device_id != own_device_id && !dedup.is_duplicate(&p.op.id))
        .collect()
}

/// 事件消费主循环（客户端关停或放弃重连后退出）
pub async fn run(ctx: Arc<DaemonContext>) {
    let mut events = ctx.client.events().subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::Connected => on_connected(&ctx),
            ClientEvent::MessageReceived(message) => on_message(&ctx, message),
            ClientEvent::Reconnecting { attempt, delay_ms } => {
                info!("等待重连: attempt={}, delay_ms={}", attempt, delay_ms);
            }
            ClientEvent::Disconnected => {
                info!("与服务端断开，增量推送暂停");
            }
            ClientEvent::GaveUp { attempts } => {
                warn!("重连放弃: attempts={}，守护进程退出事件循环", attempts);
                break;
            }
            ClientEvent::Error(e) => {
                warn!("客户端错误: {}", e);
            }
        }
    }
}

/// 连接建立：声明设备身份并携游标对账
fn on_connected(ctx: &DaemonContext) {
    info!("连接建立，发起注册与对账: cursor={}", ctx.cursor.get());
    let browser = ctx.config.browser_type.clone();
    let register = ClientMessage::RegisterDevice {
        device_id: ctx.config.device_id.clone(),
        browser_type: match marksync::BrowserType::parse(&browser) {
            Ok(b) => b,
            Err(_) => marksync::BrowserType::Chrome,
        },
        device_name: ctx.config.device_name.clone(),
    };
    if let Err(e) = ctx.client.send(register) {
        warn!("注册消息发送失败: {}", e);
        return;
    }
    let check_in = ClientMessage::CheckIn {
        device_id: ctx.config.device_id.clone(),
        last_sync_version: ctx.cursor.get(),
    };
    if let Err(e) = ctx.client.send(check_in) {
        warn!("对账消息发送失败: {}", e);
    }
}

fn on_message(ctx: &DaemonContext, message: ServerMessage) {
    match message {
        ServerMessage::SyncDelta {
            operations,
            current_version,
            your_version,
        } => {
            let fresh = filter_echo(&ctx.config.device_id, &ctx.dedup, operations);
            for p in &fresh {
                ctx.dedup.mark_seen(&p.op.id);
            }
            if let Err(e) = ctx.cursor.advance(your_version) {
                warn!("游标落盘失败: {}", e);
            }
            if fresh.is_empty() {
                return;
            }
            info!(
                "收到增量: fresh={}, current_version={}",
                fresh.len(),
                current_version
            );
            let _ = ctx.delta_tx.send(HostReply::Delta {
                operations: fresh,
                current_version,
            });
        }
        ServerMessage::Conflict {
            conflict_id,
            resolution,
            ..
        } => {
            info!(
                "服务端裁决冲突: conflict_id={}, resolution={:?}",
                conflict_id, resolution
            );
        }
        ServerMessage::Error {
            code,
            message,
            recoverable,
        } => {
            warn!(
                "服务端报错: code={}, recoverable={}, message={}",
                code, recoverable, message
            );
        }
        ServerMessage::Pong | ServerMessage::Ack { .. } | ServerMessage::ChunkAck { .. } => {}
    }
}
