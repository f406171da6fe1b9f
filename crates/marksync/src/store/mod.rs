//! 操作日志存储
//!
//! 抽象为"按用户追加、按版本游标查询"的仅追加日志，另附少量键值表
//! （主控设备指定）。进程重启不丢已落库操作是本系统的承重不变量；
//! 审核队列与连接注册表则只活在内存里。

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{BrowserType, OpType, PersistedOperation, SyncOperation};

pub use sqlite::SqliteStore;

/// 活动日志查询条件
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFilter {
    /// 按操作类型过滤
    #[serde(default)]
    pub action: Option<OpType>,
    /// 按浏览器过滤
    #[serde(default)]
    pub browser: Option<BrowserType>,
    /// 起始时间（UTC 毫秒，含）
    #[serde(default)]
    pub from: Option<i64>,
    /// 截止时间（UTC 毫秒，含）
    #[serde(default)]
    pub to: Option<i64>,
    /// 页码（从 1 开始）
    #[serde(default)]
    pub page: Option<u32>,
    /// 每页条数
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// 活动日志分页结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    pub entries: Vec<PersistedOperation>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// 操作日志存储接口
///
/// 具体引擎可替换；本 crate 自带 SQLite 实现。
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// 以同一版本号批量落库一组操作（操作 id 冲突时幂等忽略）
    async fn append_operations(
        &self,
        user_id: &str,
        operations: &[SyncOperation],
        version: u64,
        browser: Option<BrowserType>,
    ) -> Result<()>;

    /// 查询某用户 `version > after_version` 且非指定设备产生的操作，
    /// 按版本升序返回
    async fn operations_after(
        &self,
        user_id: &str,
        exclude_device_id: &str,
        after_version: u64,
    ) -> Result<Vec<PersistedOperation>>;

    /// 某用户当前最大版本号（空日志为 0）
    async fn max_version(&self, user_id: &str) -> Result<u64>;

    /// 清空某用户的全部日志（整库重置逃生通道），返回删除条数
    async fn clear_user(&self, user_id: &str) -> Result<usize>;

    /// 分页查询活动日志
    async fn activity(&self, user_id: &str, filter: &ActivityFilter) -> Result<ActivityPage>;

    /// 读取主控设备指定
    async fn canonical_device(&self, user_id: &str) -> Result<Option<String>>;

    /// 写入主控设备指定（覆盖旧值）
    async fn set_canonical_device(&self, user_id: &str, device_id: &str) -> Result<()>;
}
