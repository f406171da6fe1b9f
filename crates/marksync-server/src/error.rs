//! HTTP 层错误映射
//!
//! 核心错误统一翻译为带数值错误码的结构化 JSON，HTTP 状态码由
//! 错误类别推出。线上协议（WebSocket）走 ERROR 消息，不经过这里。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use marksync::{ErrorCategory, ErrorCode, MarksyncError};
use serde::Serialize;

/// HTTP 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
    pub recoverable: bool,
    pub suggestion: String,
}

#[derive(Debug)]
pub struct ApiError(pub MarksyncError);

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self(MarksyncError::protocol(ErrorCode::AuthFailed, message))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(MarksyncError::protocol(
            ErrorCode::MalformedRequest,
            message,
        ))
    }
}

impl From<MarksyncError> for ApiError {
    fn from(error: MarksyncError) -> Self {
        Self(error)
    }
}

fn status_of(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthFailed | ErrorCode::PermissionDenied => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Duplicate | ErrorCode::Conflict | ErrorCode::VersionMismatch => {
            StatusCode::CONFLICT
        }
        ErrorCode::SyncInProgress => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::SpecialFolderImmutable => StatusCode::FORBIDDEN,
        ErrorCode::NoCanonicalDevice => StatusCode::PRECONDITION_FAILED,
        _ => match code.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Connection => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.error_code();
        let body = ErrorBody {
            code: code.code(),
            message: self.0.to_string(),
            recoverable: code.recoverable(),
            suggestion: code.suggestion().to_string(),
        };
        (status_of(code), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_by_code() {
        assert_eq!(status_of(ErrorCode::AuthFailed), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(ErrorCode::SyncInProgress),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ErrorCode::MalformedRequest),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ErrorCode::StorageUnavailable),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
