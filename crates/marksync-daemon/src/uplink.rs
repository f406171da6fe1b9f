//! 上行消息编码
//!
//! SYNC_OPS 批量过大时不能整条发出（服务端单消息上限约 1MB），改为
//! CHUNK_START / CHUNK_DATA / CHUNK_END 序列：内层消息 JSON 序列化后
//! base64 编码，按固定尺寸切片携带。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use marksync::framing::{DEFAULT_CHUNK_SIZE, DEFAULT_SINGLE_THRESHOLD};
use marksync::types::SyncOperation;
use marksync::{ClientMessage, Result};
use tracing::debug;
use uuid::Uuid;

/// 把一批操作编码为待发送的消息序列（单条或分片）
pub fn encode_sync_ops(
    device_id: &str,
    operations: Vec<SyncOperation>,
) -> Result<Vec<ClientMessage>> {
    encode_with_limits(
        device_id,
        operations,
        DEFAULT_SINGLE_THRESHOLD,
        DEFAULT_CHUNK_SIZE,
    )
}

fn encode_with_limits(
    device_id: &str,
    operations: Vec<SyncOperation>,
    single_threshold: usize,
    chunk_size: usize,
) -> Result<Vec<ClientMessage>> {
    let inner = ClientMessage::SyncOps {
        device_id: device_id.to_string(),
        operations,
    };
    let raw = serde_json::to_vec(&inner)?;
    let encoded = BASE64.encode(&raw);
    if encoded.len() <= single_threshold {
        return Ok(vec![inner]);
    }

    let chunk_id = Uuid::new_v4().to_string();
    let slices: Vec<&str> = encoded
        .as_bytes()
        .chunks(chunk_size)
        // base64 字母表是单字节字符，任意字节边界都是合法 UTF-8 边界
        .map(|s| std::str::from_utf8(s).expect("base64 切片必为 ASCII"))
        .collect();
    let total = slices.len() as u32;
    debug!(
        "批量过大转分片: bytes={}, chunks={}, chunk_id={}",
        encoded.len(),
        total,
        chunk_id
    );

    let mut messages = Vec::with_capacity(slices.len() + 2);
    messages.push(ClientMessage::ChunkStart {
        chunk_id: chunk_id.clone(),
        total,
    });
    for (index, slice) in slices.into_iter().enumerate() {
        messages.push(ClientMessage::ChunkData {
            chunk_id: chunk_id.clone(),
            index: index as u32,
            total,
            data: slice.to_string(),
        });
    }
    messages.push(ClientMessage::ChunkEnd { chunk_id });
    Ok(messages)
}
