//! WebSocket 接入
//!
//! 每条连接对应一台设备：升级时按查询参数完成鉴权与注册，之后进入
//! 收发循环。出站走注册表分配的通道（广播与直答共用），入站按消息
//! 类型分发；超大消息经 CHUNK_* 序列传入，收齐后当作普通入站消息
//! 递归处理。连接断开时注销设备。

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::StreamExt;
use futures::SinkExt;
use marksync::framing::ChunkAssembler;
use marksync::types::BrowserType;
use marksync::{ClientMessage, MarksyncError, Result, ServerMessage};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::flow::submit_operations;
use crate::routes::check_token;
use crate::state::AppState;

/// 分片重组的保留窗口，超时未收齐的序列被清理
const CHUNK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsAuthQuery {
    #[serde(default)]
    token: Option<String>,
    user_id: String,
    device_id: String,
    #[serde(default)]
    browser_type: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    upgrade: WebSocketUpgrade,
) -> std::result::Result<Response, ApiError> {
    if !check_token(state.config.token.as_deref(), query.token.as_deref()) {
        return Err(ApiError::unauthorized("令牌缺失或不匹配"));
    }
    if query.user_id.is_empty() || query.device_id.is_empty() {
        return Err(ApiError::bad_request("userId 与 deviceId 均不能为空"));
    }
    let browser = match query.browser_type.as_deref() {
        Some(raw) if !raw.is_empty() => BrowserType::parse(raw)?,
        _ => BrowserType::Chrome,
    };
    Ok(upgrade.on_upgrade(move |socket| handle_socket(state, socket, query, browser)))
}

async fn handle_socket(state: AppState, socket: WebSocket, query: WsAuthQuery, browser: BrowserType) {
    let user_id = query.user_id;
    let device_id = query.device_id;
    info!("WebSocket 连接建立: user_id={}, device_id={}", user_id, device_id);

    let mut outbound =
        state
            .registry
            .register(&device_id, &user_id, browser, query.device_name.clone());
    let assembler = Arc::new(ChunkAssembler::new(CHUNK_TTL));
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("出站消息序列化失败: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_text(
                            &state, &user_id, &device_id, browser, &assembler, text.as_str(),
                        )
                        .await;
                        let mut closed = false;
                        for reply in replies {
                            let text = match serde_json::to_string(&reply) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("应答序列化失败: {}", e);
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        state.registry.touch(&device_id);
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket 读取出错: device_id={}, err={}", device_id, e);
                        break;
                    }
                }
            }
            else => break,
        }
    }

    state.registry.disconnect(&device_id);
    info!("WebSocket 连接关闭: user_id={}, device_id={}", user_id, device_id);
}

async fn handle_text(
    state: &AppState,
    user_id: &str,
    device_id: &str,
    browser: BrowserType,
    assembler: &Arc<ChunkAssembler>,
    text: &str,
) -> Vec<ServerMessage> {
    state.registry.touch(device_id);
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("入站消息解析失败: device_id={}, err={}", device_id, e);
            return vec![ServerMessage::from_error(&MarksyncError::protocol(
                marksync::ErrorCode::MalformedRequest,
                format!("消息解析失败: {}", e),
            ))];
        }
    };
    match dispatch(state, user_id, device_id, browser, assembler, message).await {
        Ok(replies) => replies,
        Err(e) => {
            warn!("消息处理失败: device_id={}, err={}", device_id, e);
            vec![ServerMessage::from_error(&e)]
        }
    }
}

fn dispatch<'a>(
    state: &'a AppState,
    user_id: &'a str,
    device_id: &'a str,
    browser: BrowserType,
    assembler: &'a Arc<ChunkAssembler>,
    message: ClientMessage,
) -> futures::future::BoxFuture<'a, Result<Vec<ServerMessage>>> {
    // 分片重组出的内层消息会再次进入这里，需要装箱递归
    Box::pin(async move {
        match message {
            ClientMessage::Ping => Ok(vec![ServerMessage::Pong]),

            ClientMessage::RegisterDevice {
                device_id: declared, ..
            } => {
                debug!("设备声明注册信息: device_id={}", declared);
                Ok(vec![ServerMessage::Ack {
                    request_id: declared,
                }])
            }

            ClientMessage::CheckIn {
                last_sync_version, ..
            } => {
                let outcome = state
                    .processor
                    .delta_for(user_id, device_id, last_sync_version)
                    .await?;
                Ok(vec![ServerMessage::SyncDelta {
                    operations: outcome.delta,
                    current_version: outcome.new_version,
                    your_version: outcome.new_version,
                }])
            }

            ClientMessage::SyncOps { operations, .. } => {
                // 游标不随 SYNC_OPS 传递，增量以 0 起点之外的对账走 CHECK_IN；
                // 这里取当前版本为游标，只追加不补拉
                let current = state.processor.current_version(user_id).await?;
                let result = submit_operations(
                    state, user_id, device_id, Some(browser), operations, current,
                )
                .await?;
                let mut replies = Vec::new();
                for conflict in &result.outcome.conflicts {
                    replies.push(ServerMessage::Conflict {
                        conflict_id: conflict.conflict_id.clone(),
                        your_op: conflict.local_op.clone(),
                        winning_op: conflict.winning_op().clone(),
                        resolution: conflict.resolution,
                    });
                }
                replies.push(ServerMessage::SyncDelta {
                    operations: result.outcome.delta,
                    current_version: result.outcome.new_version,
                    your_version: result.outcome.new_version,
                });
                Ok(replies)
            }

            ClientMessage::ChunkStart { chunk_id, total } => {
                // 顺带清扫超时未收齐的序列，断头分片不随连接常驻
                assembler.sweep_expired();
                assembler.begin(&chunk_id, total)?;
                Ok(vec![ServerMessage::ChunkAck {
                    chunk_id,
                    received_chunks: 0,
                }])
            }

            ClientMessage::ChunkData {
                chunk_id,
                index,
                total,
                data,
            } => {
                assembler.sweep_expired();
                let received_chunks = assembler.accept_chunk(&chunk_id, index, total, data)?;
                Ok(vec![ServerMessage::ChunkAck {
                    chunk_id,
                    received_chunks,
                }])
            }

            ClientMessage::ChunkEnd { chunk_id } => {
                let raw = assembler.finish(&chunk_id)?;
                let inner: ClientMessage = serde_json::from_slice(&raw)?;
                debug!("分片重组完成: chunk_id={}, bytes={}", chunk_id, raw.len());
                dispatch(state, user_id, device_id, browser, assembler, inner).await
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync::types::{OperationPayload, SyncOperation};

    fn add_op(url: &str) -> SyncOperation {
        SyncOperation::new(
            format!("bm:{}", url),
            OperationPayload::Add {
                title: url.to_string(),
                url: url.to_string(),
                folder_path: None,
                folder_type: None,
            },
            "dev_a",
        )
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = AppState::for_test();
        let assembler = Arc::new(ChunkAssembler::new(CHUNK_TTL));
        let replies = dispatch(
            &state, "u1", "dev_a", BrowserType::Chrome, &assembler, ClientMessage::Ping,
        )
        .await
        .unwrap();
        assert!(matches!(replies[0], ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_sync_ops_then_check_in_from_other_device() {
        let state = AppState::for_test();
        let assembler = Arc::new(ChunkAssembler::new(CHUNK_TTL));

        let replies = dispatch(
            &state,
            "u1",
            "dev_a",
            BrowserType::Chrome,
            &assembler,
            ClientMessage::SyncOps {
                device_id: "dev_a".to_string(),
                operations: vec![add_op("https://a.com")],
            },
        )
        .await
        .unwrap();
        let version = match replies.last().unwrap() {
            ServerMessage::SyncDelta { your_version, .. } => *your_version,
            other => panic!("期待 SYNC_DELTA，得到 {:?}", other),
        };
        assert!(version > 0);

        let replies = dispatch(
            &state,
            "u1",
            "dev_b",
            BrowserType::Firefox,
            &assembler,
            ClientMessage::CheckIn {
                device_id: "dev_b".to_string(),
                last_sync_version: 0,
            },
        )
        .await
        .unwrap();
        match &replies[0] {
            ServerMessage::SyncDelta { operations, .. } => assert_eq!(operations.len(), 1),
            other => panic!("期待 SYNC_DELTA，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunked_sync_ops_round_trip() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let state = AppState::for_test();
        let assembler = Arc::new(ChunkAssembler::new(CHUNK_TTL));

        let inner = ClientMessage::SyncOps {
            device_id: "dev_a".to_string(),
            operations: vec![add_op("https://big.com")],
        };
        let raw = serde_json::to_vec(&inner).unwrap();
        let encoded = BASE64.encode(&raw);
        let half = encoded.len() / 2;

        let messages = vec![
            ClientMessage::ChunkStart {
                chunk_id: "c1".to_string(),
                total: 2,
            },
            ClientMessage::ChunkData {
                chunk_id: "c1".to_string(),
                index: 0,
                total: 2,
                data: encoded[..half].to_string(),
            },
            ClientMessage::ChunkData {
                chunk_id: "c1".to_string(),
                index: 1,
                total: 2,
                data: encoded[half..].to_string(),
            },
            ClientMessage::ChunkEnd {
                chunk_id: "c1".to_string(),
            },
        ];
        let mut last = Vec::new();
        for message in messages {
            last = dispatch(
                &state, "u1", "dev_a", BrowserType::Chrome, &assembler, message,
            )
            .await
            .unwrap();
        }
        // CHUNK_END 重组出 SYNC_OPS 并走完整同步路径
        assert!(matches!(last.last().unwrap(), ServerMessage::SyncDelta { .. }));
    }

    #[tokio::test]
    async fn test_stale_chunk_sequence_swept_on_next_chunk_message() {
        let state = AppState::for_test();
        // 零保留窗口：上一组分片在下一条分片消息到来时即被清扫
        let assembler = Arc::new(ChunkAssembler::new(Duration::ZERO));

        dispatch(
            &state,
            "u1",
            "dev_a",
            BrowserType::Chrome,
            &assembler,
            ClientMessage::ChunkStart {
                chunk_id: "abandoned".to_string(),
                total: 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(assembler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatch(
            &state,
            "u1",
            "dev_a",
            BrowserType::Chrome,
            &assembler,
            ClientMessage::ChunkStart {
                chunk_id: "fresh".to_string(),
                total: 2,
            },
        )
        .await
        .unwrap();
        // 断头序列已被回收，只剩新声明的一组
        assert_eq!(assembler.pending_count(), 1);
        assert_eq!(assembler.received_count("abandoned"), 0);
    }

    #[tokio::test]
    async fn test_unknown_chunk_end_reports_error() {
        let state = AppState::for_test();
        let assembler = Arc::new(ChunkAssembler::new(CHUNK_TTL));
        let err = dispatch(
            &state,
            "u1",
            "dev_a",
            BrowserType::Chrome,
            &assembler,
            ClientMessage::ChunkEnd {
                chunk_id: "nope".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), marksync::ErrorCode::ChunkReassemblyFailed);
    }
}
