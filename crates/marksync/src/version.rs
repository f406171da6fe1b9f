//! 版本信息

/// 当前构建版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 版本字符串，用于 /version 接口与日志
pub fn version_string() -> String {
    format!("marksync {}", VERSION)
}
