//! 本机助手接入
//!
//! 浏览器助手进程经 localhost TCP 连入，双向走 4 字节长度前缀的 JSON
//! 帧。每条连接先以 HELLO 握手声明身份，之后助手可随时 QUEUE_OPS 提交
//! 本地变更、STATUS 查询连接状态；服务端推来的增量经广播通道扇出到
//! 每条助手连接。

use std::sync::Arc;

use marksync::framing::{FrameReader, FrameWriter};
use marksync::{
    ConnectionState, ErrorCode, HostMessage, HostReply, MarksyncError, Result,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::DaemonContext;
use crate::uplink;

pub async fn serve(ctx: Arc<DaemonContext>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("助手连接接入: peer={}", peer);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_helper(ctx, stream).await {
                        warn!("助手连接异常结束: peer={}, err={}", peer, e);
                    } else {
                        info!("助手连接关闭: peer={}", peer);
                    }
                });
            }
            Err(e) => {
                warn!("accept 失败: {}", e);
            }
        }
    }
}

fn host_error(error: &MarksyncError) -> HostReply {
    let code = error.error_code();
    HostReply::Error {
        code: code.code(),
        message: error.to_string(),
        recoverable: code.recoverable(),
    }
}

/// 服务一条助手连接直到对端关闭
///
/// 流类型保持泛型，测试可用内存双工流直接驱动。
pub async fn handle_helper<S>(ctx: Arc<DaemonContext>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    // 握手必须是第一条消息
    match reader.read_message::<HostMessage>().await? {
        Some(HostMessage::Hello {
            device_id,
            browser_type,
        }) => {
            debug!("助手握手: device_id={}, browser={}", device_id, browser_type);
        }
        Some(_) => {
            let err = MarksyncError::protocol(
                ErrorCode::MalformedRequest,
                "握手前收到其他消息，连接关闭",
            );
            writer.write_message(&host_error(&err)).await?;
            return Err(err);
        }
        None => return Ok(()),
    }

    let mut delta_rx = ctx.delta_tx.subscribe();
    loop {
        tokio::select! {
            incoming = reader.read_message::<HostMessage>() => {
                match incoming? {
                    Some(HostMessage::QueueOps { operations }) => {
                        debug!("助手提交操作: count={}", operations.len());
                        // 先登记再上送，回传的增量据此识别回声
                        for op in &operations {
                            ctx.dedup.mark_seen(&op.id);
                        }
                        let send_result = uplink::encode_sync_ops(&ctx.config.device_id, operations)
                            .and_then(|messages| {
                                for message in messages {
                                    ctx.client.send(message)?;
                                }
                                Ok(())
                            });
                        if let Err(e) = send_result {
                            warn!("上送失败: {}", e);
                            writer.write_message(&host_error(&e)).await?;
                        }
                    }
                    Some(HostMessage::Status) => {
                        writer
                            .write_message(&HostReply::Status {
                                connected: ctx.client.state() == ConnectionState::Connected,
                                last_sync_version: ctx.cursor.get(),
                            })
                            .await?;
                    }
                    // 重复握手幂等忽略
                    Some(HostMessage::Hello { .. }) => {}
                    None => break,
                }
            }
            reply = delta_rx.recv() => {
                match reply {
                    Ok(reply) => writer.write_message(&reply).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("助手消费过慢，跳过 {} 条增量", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}
