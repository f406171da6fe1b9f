//! 线上协议消息定义
//!
//! 两套消息面：
//! - WebSocket 协议（daemon/扩展 ⇄ 同步服务），`type` 字段为大写蛇形标签；
//! - 本机流协议（daemon ⇄ 浏览器助手进程），走 4 字节长度前缀帧，
//!   消息体同为 JSON。

use serde::{Deserialize, Serialize};

use crate::types::{BrowserType, PersistedOperation, SyncOperation};

/// 客户端 → 服务端消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "REGISTER_DEVICE", rename_all = "camelCase")]
    RegisterDevice {
        device_id: String,
        browser_type: BrowserType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
    /// 上线对账：携带本地游标，期待服务端回 SYNC_DELTA
    #[serde(rename = "CHECK_IN", rename_all = "camelCase")]
    CheckIn {
        device_id: String,
        last_sync_version: u64,
    },
    #[serde(rename = "SYNC_OPS", rename_all = "camelCase")]
    SyncOps {
        device_id: String,
        operations: Vec<SyncOperation>,
    },
    /// 分片传输：声明一次分片序列
    #[serde(rename = "CHUNK_START", rename_all = "camelCase")]
    ChunkStart { chunk_id: String, total: u32 },
    #[serde(rename = "CHUNK_DATA", rename_all = "camelCase")]
    ChunkData {
        chunk_id: String,
        index: u32,
        total: u32,
        data: String,
    },
    /// 分片传输结束，服务端据此触发重组
    #[serde(rename = "CHUNK_END", rename_all = "camelCase")]
    ChunkEnd { chunk_id: String },
}

/// 服务端 → 客户端消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ACK", rename_all = "camelCase")]
    Ack { request_id: String },
    #[serde(rename = "SYNC_DELTA", rename_all = "camelCase")]
    SyncDelta {
        operations: Vec<PersistedOperation>,
        /// 服务端当前版本
        current_version: u64,
        /// 该设备应记住的新游标
        your_version: u64,
    },
    #[serde(rename = "CONFLICT", rename_all = "camelCase")]
    Conflict {
        conflict_id: String,
        your_op: SyncOperation,
        winning_op: SyncOperation,
        resolution: crate::types::ConflictResolution,
    },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        code: u32,
        message: String,
        recoverable: bool,
    },
    #[serde(rename = "CHUNK_ACK", rename_all = "camelCase")]
    ChunkAck {
        chunk_id: String,
        received_chunks: u32,
    },
}

impl ServerMessage {
    /// 从错误构造 ERROR 消息
    pub fn from_error(error: &crate::error::MarksyncError) -> Self {
        let code = error.error_code();
        ServerMessage::Error {
            code: code.code(),
            message: error.to_string(),
            recoverable: code.recoverable(),
        }
    }
}

/// 浏览器助手进程 → daemon（本机流协议）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// 握手：声明助手所属的浏览器实例
    #[serde(rename = "HELLO", rename_all = "camelCase")]
    Hello {
        device_id: String,
        browser_type: BrowserType,
    },
    /// 本地变更产生的操作，交由 daemon 转发
    #[serde(rename = "QUEUE_OPS", rename_all = "camelCase")]
    QueueOps { operations: Vec<SyncOperation> },
    /// 查询 daemon 当前连接状态
    #[serde(rename = "STATUS")]
    Status,
}

/// daemon → 浏览器助手进程（本机流协议）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostReply {
    #[serde(rename = "DELTA", rename_all = "camelCase")]
    Delta {
        operations: Vec<PersistedOperation>,
        current_version: u64,
    },
    #[serde(rename = "STATUS", rename_all = "camelCase")]
    Status {
        connected: bool,
        last_sync_version: u64,
    },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        code: u32,
        message: String,
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationPayload;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::CheckIn {
            device_id: "dev_1".to_string(),
            last_sync_version: 42,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "CHECK_IN");
        assert_eq!(json["lastSyncVersion"], 42);
    }

    #[test]
    fn test_sync_ops_round_trip() {
        let msg = ClientMessage::SyncOps {
            device_id: "dev_1".to_string(),
            operations: vec![SyncOperation::new(
                "bm_1",
                OperationPayload::Delete {
                    url: Some("https://example.com".to_string()),
                    title: None,
                },
                "dev_1",
            )],
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_server_error_from_marksync_error() {
        let err = crate::error::MarksyncError::protocol(
            crate::error::ErrorCode::SyncInProgress,
            "同步进行中",
        );
        match ServerMessage::from_error(&err) {
            ServerMessage::Error { code, recoverable, .. } => {
                assert_eq!(code, 4005);
                assert!(recoverable);
            }
            other => panic!("意外的消息类型: {:?}", other),
        }
    }
}
