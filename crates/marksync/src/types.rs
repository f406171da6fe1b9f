//! 数据模型定义
//!
//! 复制的最小单元是 `SyncOperation`：由发起设备生成 id，经服务端落入
//! 操作日志后获得单调递增的 `version`，作为增量查询的唯一游标。
//! 操作一经落库即不可变。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, MarksyncError, Result};

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "MOVE")]
    Move,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Add => "ADD",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::Move => "MOVE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "ADD" => Ok(OpType::Add),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            "MOVE" => Ok(OpType::Move),
            other => Err(MarksyncError::protocol(
                ErrorCode::MalformedRequest,
                format!("未知操作类型: {}", other),
            )),
        }
    }

    /// 是否属于破坏性操作（非主控设备提交时进入审核队列）
    pub fn is_destructive(&self) -> bool {
        matches!(self, OpType::Delete | OpType::Move | OpType::Update)
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 浏览器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chrome,
    Firefox,
    Edge,
    Safari,
    Brave,
}

impl BrowserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserType::Chrome => "chrome",
            BrowserType::Firefox => "firefox",
            BrowserType::Edge => "edge",
            BrowserType::Safari => "safari",
            BrowserType::Brave => "brave",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "chrome" => Ok(BrowserType::Chrome),
            "firefox" => Ok(BrowserType::Firefox),
            "edge" => Ok(BrowserType::Edge),
            "safari" => Ok(BrowserType::Safari),
            "brave" => Ok(BrowserType::Brave),
            other => Err(MarksyncError::protocol(
                ErrorCode::InvalidBrowserTag,
                format!("不支持的浏览器标识: {}", other),
            )),
        }
    }
}

impl std::fmt::Display for BrowserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 操作负载（按 opType 区分的和类型）
///
/// 线上 JSON 形态为内部标签：`opType` 与各变体字段平铺在操作对象顶层，
/// 编译期即可对 ADD/UPDATE/DELETE/MOVE 的处理做穷尽检查。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opType")]
pub enum OperationPayload {
    #[serde(rename = "ADD", rename_all = "camelCase")]
    Add {
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_path: Option<String>,
        /// 目录类型提示（如 "toolbar"、"menu"）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_type: Option<String>,
    },
    #[serde(rename = "UPDATE", rename_all = "camelCase")]
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_url: Option<String>,
    },
    #[serde(rename = "DELETE", rename_all = "camelCase")]
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename = "MOVE", rename_all = "camelCase")]
    Move {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_parent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_parent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_index: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_index: Option<u32>,
    },
}

impl OperationPayload {
    pub fn op_type(&self) -> OpType {
        match self {
            OperationPayload::Add { .. } => OpType::Add,
            OperationPayload::Update { .. } => OpType::Update,
            OperationPayload::Delete { .. } => OpType::Delete,
            OperationPayload::Move { .. } => OpType::Move,
        }
    }

    /// 提取负载中的 URL（用于按 URL 匹配同一逻辑书签）
    pub fn url(&self) -> Option<&str> {
        match self {
            OperationPayload::Add { url, .. } => Some(url.as_str()),
            OperationPayload::Update { url, .. } => url.as_deref(),
            OperationPayload::Delete { url, .. } => url.as_deref(),
            OperationPayload::Move { .. } => None,
        }
    }
}

/// 同步操作 - 复制的最小单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// 发起设备分配的唯一标识
    pub id: String,
    /// 受影响书签的稳定逻辑标识（与设备本地的原生 ID 区分）
    pub bookmark_id: String,
    #[serde(flatten)]
    pub payload: OperationPayload,
    /// 发起时间（UTC 毫秒），仅用于冲突裁决的平手比较，不承担全局排序
    pub timestamp: i64,
    /// 发起设备
    pub source_device_id: String,
}

impl SyncOperation {
    /// 创建一条新操作（id 由本地生成）
    pub fn new(bookmark_id: impl Into<String>, payload: OperationPayload, source_device_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bookmark_id: bookmark_id.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            source_device_id: source_device_id.into(),
        }
    }

    pub fn op_type(&self) -> OpType {
        self.payload.op_type()
    }

    /// 判断两条操作是否指向同一逻辑书签
    ///
    /// 匹配规则：bookmark_id 相同，或两侧负载都带 URL 且归一化后相同。
    pub fn same_bookmark(&self, other: &SyncOperation) -> bool {
        if self.bookmark_id == other.bookmark_id {
            return true;
        }
        match (self.payload.url(), other.payload.url()) {
            (Some(a), Some(b)) => normalize_url(a) == normalize_url(b),
            _ => false,
        }
    }
}

/// 已落库的操作记录（附服务端分配的版本号）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOperation {
    /// 服务端分配的单调版本号，增量查询的唯一游标
    pub version: u64,
    #[serde(flatten)]
    pub op: SyncOperation,
    /// 提交该操作的浏览器类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserType>,
}

/// 冲突裁决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// 本次提交的操作获胜
    LocalWins,
    /// 已落库的远端操作获胜
    RemoteWins,
}

/// 冲突记录 - 同一轮对账内两条操作指向同一逻辑书签时产生
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_id: String,
    /// 本次提交侧的操作
    pub local_op: SyncOperation,
    /// 已落库侧的操作
    pub remote_op: PersistedOperation,
    pub resolution: ConflictResolution,
}

impl Conflict {
    pub fn new(local_op: SyncOperation, remote_op: PersistedOperation, resolution: ConflictResolution) -> Self {
        Self {
            conflict_id: Uuid::new_v4().to_string(),
            local_op,
            remote_op,
            resolution,
        }
    }

    /// 获胜方操作
    pub fn winning_op(&self) -> &SyncOperation {
        match self.resolution {
            ConflictResolution::LocalWins => &self.local_op,
            ConflictResolution::RemoteWins => &self.remote_op.op,
        }
    }
}

/// 审核条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    Pending,
    Accepted,
    Rejected,
}

/// 待审核条目 - 非主控设备提交的受审操作，等待人工裁决
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingModeration {
    pub id: String,
    pub op_type: OpType,
    /// 提交方浏览器；提交时未声明则为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserType>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// UPDATE 的修改前快照，拒绝时据此合成还原操作
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_id: Option<String>,
    /// 提交设备
    pub device_id: String,
    pub status: ModerationStatus,
    /// 入队时间（UTC 毫秒）
    pub queued_at: i64,
}

/// URL 归一化
///
/// 用于"同一逻辑书签"的匹配：去掉首尾空白与片段标识，
/// scheme 与 host 统一小写，去掉尾部斜杠。
pub fn normalize_url(raw: &str) -> String {
    let mut url = raw.trim();
    if let Some(pos) = url.find('#') {
        url = &url[..pos];
    }
    let url = url.trim_end_matches('/');

    // 仅对 scheme://host 部分做小写处理，path/query 保持原样
    if let Some(scheme_end) = url.find("://") {
        let after_scheme = &url[scheme_end + 3..];
        let host_end = after_scheme
            .find('/')
            .unwrap_or(after_scheme.len());
        let (host, rest) = after_scheme.split_at(host_end);
        format!(
            "{}://{}{}",
            url[..scheme_end].to_ascii_lowercase(),
            host.to_ascii_lowercase(),
            rest
        )
    } else {
        url.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_format_carries_op_type() {
        let op = SyncOperation::new(
            "bm_1",
            OperationPayload::Add {
                title: "示例".to_string(),
                url: "https://example.com".to_string(),
                folder_path: Some("工具栏/开发".to_string()),
                folder_type: None,
            },
            "device_a",
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["opType"], "ADD");
        assert_eq!(json["bookmarkId"], "bm_1");
        assert_eq!(json["url"], "https://example.com");

        let back: SyncOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Path/"),
            "https://example.com/Path"
        );
        assert_eq!(
            normalize_url("https://example.com/page#section"),
            "https://example.com/page"
        );
        assert_eq!(
            normalize_url(" https://example.com "),
            "https://example.com"
        );
    }

    #[test]
    fn test_same_bookmark_matches_by_url() {
        let a = SyncOperation::new(
            "bm_a",
            OperationPayload::Add {
                title: "X".to_string(),
                url: "https://x.com/".to_string(),
                folder_path: None,
                folder_type: None,
            },
            "device_a",
        );
        let b = SyncOperation::new(
            "bm_b",
            OperationPayload::Delete {
                url: Some("https://X.com".to_string()),
                title: None,
            },
            "device_b",
        );
        assert!(a.same_bookmark(&b));

        let c = SyncOperation::new(
            "bm_c",
            OperationPayload::Move {
                old_parent: None,
                new_parent: Some("folder_1".to_string()),
                old_index: Some(0),
                new_index: Some(3),
            },
            "device_b",
        );
        // MOVE 无 URL，只按 bookmark_id 匹配
        assert!(!a.same_bookmark(&c));
    }

    #[test]
    fn test_browser_tag_validation() {
        assert_eq!(BrowserType::parse("Chrome").unwrap(), BrowserType::Chrome);
        let err = BrowserType::parse("netscape").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidBrowserTag);
    }
}
