//! Marksync - 多设备书签同步引擎
//!
//! 围绕一条按用户追加的操作日志构建同步：设备提交书签操作
//! （ADD / UPDATE / DELETE / MOVE），服务端按单调版本号落盘并向
//! 其余设备推送增量，设备用游标补拉离线期间错过的部分。包括：
//! - 📝 操作日志：SQLite 落盘，幂等追加，游标增量查询
//! - ⚖️ 冲突消解：同一书签并发修改按时间戳最后写入者胜
//! - 🛡️ 审核工作流：主控设备对破坏性操作先裁决后生效
//! - 📦 消息分块：超大批量经 base64 分块传输并按 TTL 重组
//! - 🔄 自动重连：指数退避加抖动，次数耗尽放弃
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marksync::{ClientConfig, ReconnectingClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         server_url: "ws://127.0.0.1:8787/ws".to_string(),
//!         user_id: "user123".to_string(),
//!         device_id: "dev_a".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let client = Arc::new(ReconnectingClient::new(config)?);
//!     let mut events = client.events().subscribe();
//!     client.start();
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("事件: {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod framing;
pub mod moderation;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod sync;
pub mod types;
pub mod version;

// 重新导出核心类型，方便使用
pub use client::{ConnectionState, ReconnectingClient};
pub use config::{ClientConfig, ReconnectConfig};
pub use dedup::DeduplicationManager;
pub use error::{ErrorCategory, ErrorCode, MarksyncError, Result};
pub use events::{ClientEvent, EventBus};
pub use framing::{ChunkAssembler, ChunkCodec, FrameReader, FrameWriter, WireEnvelope};
pub use moderation::{
    ModerationDecision, ModerationManager, ModerationPolicy, ModerationSubmission,
};
pub use protocol::{ClientMessage, HostMessage, HostReply, ServerMessage};
pub use registry::{ConnectionRegistry, DeviceInfo};
pub use store::{ActivityFilter, ActivityPage, OperationStore, SqliteStore};
pub use sync::{SyncGuard, SyncOutcome, SyncProcessor};
pub use types::{
    normalize_url, BrowserType, Conflict, ConflictResolution, ModerationStatus, OpType,
    OperationPayload, PendingModeration, PersistedOperation, SyncOperation,
};
