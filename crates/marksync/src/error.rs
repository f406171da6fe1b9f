//! 错误类型定义
//!
//! 错误码按数值区间划分类别：
//! - 1xxx 连接类（传输/认证丢失、超时）
//! - 2xxx 校验类（请求格式、未知目录路径、非法浏览器标识）
//! - 3xxx 操作类（不存在、重复、权限、特殊目录不可改）
//! - 4xxx 同步类（冲突、部分失败、版本不匹配、无主控设备、同步进行中）
//! - 5xxx 系统类（存储不可用、资源耗尽、分片重组失败）
//!
//! 每个错误码附带 `recoverable` 标记与建议动作，供调用方决定重试策略。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 连接类错误
    Connection,
    /// 校验类错误
    Validation,
    /// 操作类错误
    Operation,
    /// 同步类错误
    Sync,
    /// 系统类错误
    System,
}

/// 协议错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // ========== 连接类 1xxx ==========
    /// 连接丢失
    ConnectionLost,
    /// 认证失败
    AuthFailed,
    /// 连接超时
    ConnectionTimeout,

    // ========== 校验类 2xxx ==========
    /// 请求格式错误
    MalformedRequest,
    /// 未知目录路径
    UnknownFolderPath,
    /// 非法浏览器标识
    InvalidBrowserTag,

    // ========== 操作类 3xxx ==========
    /// 目标不存在
    NotFound,
    /// 重复操作
    Duplicate,
    /// 权限不足
    PermissionDenied,
    /// 特殊目录不可修改
    SpecialFolderImmutable,

    // ========== 同步类 4xxx ==========
    /// 同步冲突
    Conflict,
    /// 部分失败
    PartialFailure,
    /// 版本不匹配
    VersionMismatch,
    /// 未设置主控设备
    NoCanonicalDevice,
    /// 同一用户的同步已在进行中
    SyncInProgress,

    // ========== 系统类 5xxx ==========
    /// 存储不可用
    StorageUnavailable,
    /// 资源耗尽
    ResourceExhausted,
    /// 分片重组失败
    ChunkReassemblyFailed,
}

impl ErrorCode {
    /// 获取数值错误码
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::ConnectionLost => 1001,
            ErrorCode::AuthFailed => 1002,
            ErrorCode::ConnectionTimeout => 1003,
            ErrorCode::MalformedRequest => 2001,
            ErrorCode::UnknownFolderPath => 2002,
            ErrorCode::InvalidBrowserTag => 2003,
            ErrorCode::NotFound => 3001,
            ErrorCode::Duplicate => 3002,
            ErrorCode::PermissionDenied => 3003,
            ErrorCode::SpecialFolderImmutable => 3004,
            ErrorCode::Conflict => 4001,
            ErrorCode::PartialFailure => 4002,
            ErrorCode::VersionMismatch => 4003,
            ErrorCode::NoCanonicalDevice => 4004,
            ErrorCode::SyncInProgress => 4005,
            ErrorCode::StorageUnavailable => 5001,
            ErrorCode::ResourceExhausted => 5002,
            ErrorCode::ChunkReassemblyFailed => 5003,
        }
    }

    /// 从数值错误码解析
    pub fn from_code(code: u32) -> Option<Self> {
        let parsed = match code {
            1001 => ErrorCode::ConnectionLost,
            1002 => ErrorCode::AuthFailed,
            1003 => ErrorCode::ConnectionTimeout,
            2001 => ErrorCode::MalformedRequest,
            2002 => ErrorCode::UnknownFolderPath,
            2003 => ErrorCode::InvalidBrowserTag,
            3001 => ErrorCode::NotFound,
            3002 => ErrorCode::Duplicate,
            3003 => ErrorCode::PermissionDenied,
            3004 => ErrorCode::SpecialFolderImmutable,
            4001 => ErrorCode::Conflict,
            4002 => ErrorCode::PartialFailure,
            4003 => ErrorCode::VersionMismatch,
            4004 => ErrorCode::NoCanonicalDevice,
            4005 => ErrorCode::SyncInProgress,
            5001 => ErrorCode::StorageUnavailable,
            5002 => ErrorCode::ResourceExhausted,
            5003 => ErrorCode::ChunkReassemblyFailed,
            _ => return None,
        };
        Some(parsed)
    }

    /// 错误类别（由数值区间决定）
    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Validation,
            3000..=3999 => ErrorCategory::Operation,
            4000..=4999 => ErrorCategory::Sync,
            _ => ErrorCategory::System,
        }
    }

    /// 是否可恢复
    ///
    /// 连接类错误与存储不可用可以退避重试；分片重组失败可整体重传；
    /// 校验类与操作类错误需要调用方修正请求，重试无意义。
    pub fn recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::Connection => true,
            ErrorCategory::Validation | ErrorCategory::Operation => false,
            ErrorCategory::Sync => matches!(self, ErrorCode::SyncInProgress),
            ErrorCategory::System => matches!(
                self,
                ErrorCode::StorageUnavailable | ErrorCode::ChunkReassemblyFailed
            ),
        }
    }

    /// 建议动作（面向人类的提示文案）
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionLost => "连接已断开，等待自动重连",
            ErrorCode::AuthFailed => "认证失败，请检查令牌配置",
            ErrorCode::ConnectionTimeout => "连接超时，稍后重试",
            ErrorCode::MalformedRequest => "请求格式错误，请检查字段后重新提交",
            ErrorCode::UnknownFolderPath => "目录路径不存在，请先创建目录",
            ErrorCode::InvalidBrowserTag => "浏览器标识不合法，请使用受支持的浏览器类型",
            ErrorCode::NotFound => "目标不存在，可能已被其他设备删除",
            ErrorCode::Duplicate => "操作重复，已被忽略",
            ErrorCode::PermissionDenied => "权限不足，无法执行该操作",
            ErrorCode::SpecialFolderImmutable => "系统特殊目录不允许修改",
            ErrorCode::Conflict => "检测到同步冲突，已按时间戳自动裁决",
            ErrorCode::PartialFailure => "部分操作未生效，请重新同步",
            ErrorCode::VersionMismatch => "版本游标不匹配，请以 0 为起点重新拉取",
            ErrorCode::NoCanonicalDevice => "尚未设置主控设备，请先指定",
            ErrorCode::SyncInProgress => "该用户的同步正在进行中，请稍后重试",
            ErrorCode::StorageUnavailable => "存储暂不可用，退避后重试",
            ErrorCode::ResourceExhausted => "资源耗尽，请减小批量或稍后重试",
            ErrorCode::ChunkReassemblyFailed => "分片重组失败，请整体重传，不要尝试修补部分分片",
        }
    }
}

/// Marksync 统一错误类型
#[derive(Debug, Error)]
pub enum MarksyncError {
    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("传输层错误: {0}")]
    Transport(String),

    #[error("未连接")]
    NotConnected,

    #[error("超时: {0}")]
    Timeout(String),

    #[error("参数不合法: {0}")]
    InvalidArgument(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("正在关闭")]
    ShuttingDown,

    /// 携带协议错误码的业务错误
    #[error("[{num}] {message}", num = .code.code())]
    Protocol { code: ErrorCode, message: String },
}

impl MarksyncError {
    /// 构造携带错误码的业务错误
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        MarksyncError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// 映射到协议错误码
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MarksyncError::Protocol { code, .. } => *code,
            MarksyncError::Sqlite(_) => ErrorCode::StorageUnavailable,
            MarksyncError::Serialization(_) | MarksyncError::InvalidArgument(_) => {
                ErrorCode::MalformedRequest
            }
            MarksyncError::Io(_) | MarksyncError::Transport(_) | MarksyncError::NotConnected => {
                ErrorCode::ConnectionLost
            }
            MarksyncError::Timeout(_) => ErrorCode::ConnectionTimeout,
            MarksyncError::Config(_) => ErrorCode::MalformedRequest,
            MarksyncError::ShuttingDown => ErrorCode::ConnectionLost,
        }
    }

    /// 是否可恢复（用于重试决策）
    pub fn is_recoverable(&self) -> bool {
        self.error_code().recoverable()
    }
}

impl From<serde_json::Error> for MarksyncError {
    fn from(error: serde_json::Error) -> Self {
        MarksyncError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarksyncError>;
