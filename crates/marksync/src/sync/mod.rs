//! 同步处理模块
//!
//! 职责：
//! - 计算设备的增量（delta）
//! - 检测并裁决冲突（按时间戳 last-write-wins）
//! - 按用户串行化处理，版本号由每用户单调计数器分配

pub mod processor;

pub use processor::{SyncGuard, SyncOutcome, SyncProcessor};
