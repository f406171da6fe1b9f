//! 分片编解码
//!
//! 面向有硬性单包上限的传输通道（约 1 MB）。消息先序列化为 JSON 再
//! base64 编码：编码后长度不超过阈值（默认 900 KB，给 1 MB 硬限留出
//! 余量）则作为 SINGLE 整体发送；超限则按固定切片大小拆成 CHUNK
//! 序列，同一序列共享一个新分配的 chunk_id，每片携带 index 与 total。
//!
//! 接收端按 chunk_id 维护 index → 切片 映射，收齐 total 片后按 index
//! 排序拼接、base64 解码、反序列化。分片乱序到达不影响重组。废弃的
//! 半成品序列由显式 clear 或 TTL 清扫回收，避免内存无界增长。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, MarksyncError, Result};

/// SINGLE 阈值：900 KB，对 1 MB 硬限留出封装开销余量
pub const DEFAULT_SINGLE_THRESHOLD: usize = 900 * 1024;

/// 单片切片大小：256 KB
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// 半成品序列默认保留时间
const DEFAULT_REASSEMBLY_TTL: Duration = Duration::from_secs(60);

/// 分片层的线上封装
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireEnvelope {
    #[serde(rename = "SINGLE")]
    Single { data: String },
    #[serde(rename = "CHUNK", rename_all = "camelCase")]
    Chunk {
        chunk_id: String,
        index: u32,
        total: u32,
        data: String,
    },
}

/// 分片编码器
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    single_threshold: usize,
    chunk_size: usize,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self {
            single_threshold: DEFAULT_SINGLE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkCodec {
    pub fn new(single_threshold: usize, chunk_size: usize) -> Self {
        Self {
            single_threshold,
            chunk_size,
        }
    }

    /// 编码一条消息
    ///
    /// 编码后长度在阈值内返回单元素 SINGLE，否则返回完整 CHUNK 序列。
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<WireEnvelope>> {
        let raw = serde_json::to_vec(message)?;
        let encoded = BASE64.encode(&raw);

        if encoded.len() <= self.single_threshold {
            return Ok(vec![WireEnvelope::Single { data: encoded }]);
        }

        let chunk_id = Uuid::new_v4().to_string();
        let slices: Vec<&str> = encoded
            .as_bytes()
            .chunks(self.chunk_size)
            // base64 字母表是单字节 ASCII，按字节切片不会劈开字符
            .map(|chunk| std::str::from_utf8(chunk).expect("base64 切片必为 ASCII"))
            .collect();
        let total = slices.len() as u32;

        debug!(
            "消息超过阈值，切片发送: chunk_id={}, encoded_len={}, total={}",
            chunk_id,
            encoded.len(),
            total
        );

        Ok(slices
            .into_iter()
            .enumerate()
            .map(|(index, data)| WireEnvelope::Chunk {
                chunk_id: chunk_id.clone(),
                index: index as u32,
                total,
                data: data.to_string(),
            })
            .collect())
    }
}

/// 解码重组后的消息体
pub fn decode_message<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| {
        MarksyncError::protocol(
            ErrorCode::ChunkReassemblyFailed,
            format!("重组后的消息无法解析: {}", e),
        )
    })
}

struct PendingTransfer {
    total: u32,
    slices: HashMap<u32, String>,
    started_at: Instant,
}

/// 分片重组器
///
/// 按 chunk_id 累积切片，收齐即重组返回。半成品由 TTL 清扫或显式
/// clear 回收。
pub struct ChunkAssembler {
    pending: Mutex<HashMap<String, PendingTransfer>>,
    ttl: Duration,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TTL)
    }
}

impl ChunkAssembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 声明一次分片序列（对应 CHUNK_START）
    pub fn begin(&self, chunk_id: &str, total: u32) -> Result<()> {
        if total == 0 {
            return Err(MarksyncError::protocol(
                ErrorCode::ChunkReassemblyFailed,
                "分片总数不能为 0",
            ));
        }
        let mut pending = self.pending.lock();
        pending.insert(
            chunk_id.to_string(),
            PendingTransfer {
                total,
                slices: HashMap::new(),
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// 接收一个封装消息；重组完成时返回原始消息体
    pub fn accept_envelope(&self, envelope: WireEnvelope) -> Result<Option<Vec<u8>>> {
        match envelope {
            WireEnvelope::Single { data } => {
                let raw = BASE64.decode(data.as_bytes()).map_err(|e| {
                    MarksyncError::protocol(
                        ErrorCode::ChunkReassemblyFailed,
                        format!("base64 解码失败: {}", e),
                    )
                })?;
                Ok(Some(raw))
            }
            WireEnvelope::Chunk {
                chunk_id,
                index,
                total,
                data,
            } => {
                let received = self.accept_chunk(&chunk_id, index, total, data)?;
                if received == total {
                    self.finish(&chunk_id).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// 接收一片分片，返回该序列已收到的分片数
    ///
    /// 收齐与否不在这里裁决：重组由 `finish`（CHUNK_END 路径）或
    /// `accept_envelope`（信封流路径）显式触发。
    pub fn accept_chunk(
        &self,
        chunk_id: &str,
        index: u32,
        total: u32,
        data: String,
    ) -> Result<u32> {
        if total == 0 || index >= total {
            return Err(MarksyncError::protocol(
                ErrorCode::ChunkReassemblyFailed,
                format!("分片下标越界: index={}, total={}", index, total),
            ));
        }

        let mut pending = self.pending.lock();
        let transfer = pending
            .entry(chunk_id.to_string())
            .or_insert_with(|| PendingTransfer {
                total,
                slices: HashMap::new(),
                started_at: Instant::now(),
            });

        if transfer.total != total {
            // total 前后不一致说明发送端状态错乱，整组作废
            pending.remove(chunk_id);
            return Err(MarksyncError::protocol(
                ErrorCode::ChunkReassemblyFailed,
                format!("分片 total 不一致: chunk_id={}", chunk_id),
            ));
        }

        // 重复下标幂等覆盖
        transfer.slices.insert(index, data);
        Ok(transfer.slices.len() as u32)
    }

    /// 结束并重组一个分片序列（对应 CHUNK_END）
    ///
    /// 未收齐时报分片重组失败并丢弃半成品，调用方应整体重传。
    pub fn finish(&self, chunk_id: &str) -> Result<Vec<u8>> {
        let transfer = {
            let mut pending = self.pending.lock();
            pending.remove(chunk_id).ok_or_else(|| {
                MarksyncError::protocol(
                    ErrorCode::ChunkReassemblyFailed,
                    format!("未知的分片序列: {}", chunk_id),
                )
            })?
        };

        if transfer.slices.len() as u32 != transfer.total {
            warn!(
                "分片未收齐即结束: chunk_id={}, received={}/{}",
                chunk_id,
                transfer.slices.len(),
                transfer.total
            );
            return Err(MarksyncError::protocol(
                ErrorCode::ChunkReassemblyFailed,
                format!(
                    "分片缺失: 收到 {}/{} 片",
                    transfer.slices.len(),
                    transfer.total
                ),
            ));
        }

        // 按 index 排序拼接，与到达顺序无关
        let mut indexed: Vec<(u32, String)> = transfer.slices.into_iter().collect();
        indexed.sort_by_key(|(index, _)| *index);
        let encoded: String = indexed.into_iter().map(|(_, data)| data).collect();

        BASE64.decode(encoded.as_bytes()).map_err(|e| {
            MarksyncError::protocol(
                ErrorCode::ChunkReassemblyFailed,
                format!("重组后 base64 解码失败: {}", e),
            )
        })
    }

    /// 某序列已收到的分片数（用于 CHUNK_ACK 回执）
    pub fn received_count(&self, chunk_id: &str) -> u32 {
        self.pending
            .lock()
            .get(chunk_id)
            .map(|t| t.slices.len() as u32)
            .unwrap_or(0)
    }

    /// 显式丢弃一个分片序列
    pub fn clear(&self, chunk_id: &str) {
        self.pending.lock().remove(chunk_id);
    }

    /// 清扫超过 TTL 的半成品序列，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, transfer| now.duration_since(transfer.started_at) <= self.ttl);
        let removed = before - pending.len();
        if removed > 0 {
            info!("清扫过期分片序列: 移除 {} 组，剩余 {} 组", removed, pending.len());
        }
        removed
    }

    /// 当前挂起的序列数
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        name: String,
        body: String,
    }

    fn blob_of_len(len: usize) -> Blob {
        Blob {
            name: "payload".to_string(),
            body: "x".repeat(len),
        }
    }

    #[test]
    fn test_small_message_is_single() {
        let codec = ChunkCodec::default();
        let envelopes = codec.encode(&blob_of_len(128)).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert!(matches!(envelopes[0], WireEnvelope::Single { .. }));
    }

    #[test]
    fn test_threshold_boundary() {
        // 小阈值便于构造边界：编码后恰好等于阈值 → SINGLE
        let codec = ChunkCodec::new(1024, 256);
        let probe = |len: usize| {
            let raw = serde_json::to_vec(&blob_of_len(len)).unwrap();
            BASE64.encode(&raw).len()
        };

        // 二分找到编码后恰好 ≤ 1024 的最大长度
        let mut fit = 0;
        for len in 0..1024 {
            if probe(len) <= 1024 {
                fit = len;
            } else {
                break;
            }
        }
        let at_threshold = codec.encode(&blob_of_len(fit)).unwrap();
        assert_eq!(at_threshold.len(), 1);
        assert!(matches!(at_threshold[0], WireEnvelope::Single { .. }));

        // 超过阈值 → CHUNK 且 total ≥ 2
        let over = codec.encode(&blob_of_len(fit + 16)).unwrap();
        assert!(over.len() >= 2);
        for envelope in &over {
            match envelope {
                WireEnvelope::Chunk { total, .. } => assert!(*total >= 2),
                other => panic!("期待 CHUNK，得到 {:?}", other),
            }
        }
    }

    #[test]
    fn test_round_trip_in_order() {
        let codec = ChunkCodec::new(512, 128);
        let assembler = ChunkAssembler::default();
        let original = blob_of_len(4096);

        let mut result = None;
        for envelope in codec.encode(&original).unwrap() {
            if let Some(raw) = assembler.accept_envelope(envelope).unwrap() {
                result = Some(raw);
            }
        }
        let decoded: Blob = decode_message(&result.expect("应重组完成")).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_round_trip_reversed_and_shuffled() {
        let codec = ChunkCodec::new(512, 128);
        let original = blob_of_len(4096);
        let envelopes = codec.encode(&original).unwrap();
        assert!(envelopes.len() >= 3);

        // 逆序投递
        let assembler = ChunkAssembler::default();
        let mut reversed = envelopes.clone();
        reversed.reverse();
        let mut result = None;
        for envelope in reversed {
            if let Some(raw) = assembler.accept_envelope(envelope).unwrap() {
                result = Some(raw);
            }
        }
        let decoded: Blob = decode_message(&result.unwrap()).unwrap();
        assert_eq!(decoded, original);

        // 乱序投递（交错取首尾）
        let assembler = ChunkAssembler::default();
        let mut shuffled = Vec::new();
        let mut rest: std::collections::VecDeque<_> = envelopes.into_iter().collect();
        while let Some(front) = rest.pop_front() {
            shuffled.push(front);
            if let Some(back) = rest.pop_back() {
                shuffled.push(back);
            }
        }
        let mut result = None;
        for envelope in shuffled {
            if let Some(raw) = assembler.accept_envelope(envelope).unwrap() {
                result = Some(raw);
            }
        }
        let decoded: Blob = decode_message(&result.unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_finish_with_missing_chunks_fails() {
        let assembler = ChunkAssembler::default();
        assembler.begin("t1", 3).unwrap();
        assembler
            .accept_chunk("t1", 0, 3, BASE64.encode(b"abc"))
            .unwrap();

        let err = assembler.finish("t1").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ChunkReassemblyFailed);
        // 失败后半成品已被丢弃，整体重传从零开始
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_ttl_sweep() {
        let assembler = ChunkAssembler::new(Duration::from_millis(0));
        assembler.begin("stale", 2).unwrap();
        assert_eq!(assembler.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(assembler.sweep_expired(), 1);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_total_mismatch_discards_group() {
        let assembler = ChunkAssembler::default();
        assembler
            .accept_chunk("t2", 0, 4, BASE64.encode(b"a"))
            .unwrap();
        let err = assembler
            .accept_chunk("t2", 1, 5, BASE64.encode(b"b"))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ChunkReassemblyFailed);
        assert_eq!(assembler.pending_count(), 0);
    }
}
