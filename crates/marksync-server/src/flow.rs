//! 同步请求的公共处理流程
//!
//! HTTP 与 WebSocket 两个入口共用同一条路径：审核闸门分流、
//! 同步处理器裁决落库、向同用户其他在线设备广播增量。

use marksync::moderation::ModerationSubmission;
use marksync::types::{BrowserType, OperationPayload, PendingModeration, SyncOperation};
use marksync::sync::SyncOutcome;
use marksync::{Result, ServerMessage};
use tracing::{debug, info};

use crate::state::AppState;

/// 一次提交的综合结果
pub struct SubmitResult {
    pub outcome: SyncOutcome,
    /// 被审核闸门拦截、已入队待裁决的操作
    pub queued: Vec<PendingModeration>,
}

/// 从同步操作构造审核提交内容
///
/// MOVE 不携带 URL，以 bookmark_id 充当去重键。
pub fn submission_from_op(op: &SyncOperation, browser: Option<BrowserType>) -> ModerationSubmission {
    let url = op
        .payload
        .url()
        .map(str::to_string)
        .unwrap_or_else(|| op.bookmark_id.clone());
    let (title, folder_path, parent_id, previous_title, previous_url) = match &op.payload {
        OperationPayload::Add {
            title, folder_path, ..
        } => (
            Some(title.clone()),
            folder_path.clone(),
            None,
            None,
            None,
        ),
        OperationPayload::Update {
            title,
            previous_title,
            previous_url,
            ..
        } => (
            title.clone(),
            None,
            None,
            previous_title.clone(),
            previous_url.clone(),
        ),
        OperationPayload::Delete { title, .. } => (title.clone(), None, None, None, None),
        OperationPayload::Move { new_parent, .. } => {
            (None, None, new_parent.clone(), None, None)
        }
    };
    ModerationSubmission {
        operation_type: op.op_type(),
        browser,
        url,
        title,
        folder_path,
        parent_id,
        previous_title,
        previous_url,
        bookmark_id: Some(op.bookmark_id.clone()),
    }
}

/// 提交一批操作：审核分流 + 裁决落库 + 广播
///
/// 已设置主控设备时，非主控设备提交的受审操作进入待审队列而不落库；
/// 未设置主控设备则一切操作直接走同步处理器。
pub async fn submit_operations(
    state: &AppState,
    user_id: &str,
    device_id: &str,
    browser: Option<BrowserType>,
    operations: Vec<SyncOperation>,
    last_sync_version: u64,
) -> Result<SubmitResult> {
    let canonical = state.moderation.canonical_device(user_id).await?;
    let gate_active = matches!(canonical.as_deref(), Some(c) if c != device_id);

    let mut direct = Vec::new();
    let mut queued = Vec::new();
    for op in operations {
        if gate_active && state.moderation.requires_moderation(op.op_type()) {
            let submission = submission_from_op(&op, browser);
            let entry = state.moderation.queue(user_id, device_id, submission).await?;
            queued.push(entry);
        } else {
            direct.push(op);
        }
    }
    if !queued.is_empty() {
        info!(
            "审核闸门拦截: user_id={}, device_id={}, queued={}",
            user_id,
            device_id,
            queued.len()
        );
    }

    let outcome = state
        .processor
        .process(user_id, device_id, direct, last_sync_version, browser)
        .await?;

    broadcast_persisted(state, user_id, Some(device_id), &outcome);

    Ok(SubmitResult { outcome, queued })
}

/// 把本批落库的操作推给同用户其余在线设备
pub fn broadcast_persisted(
    state: &AppState,
    user_id: &str,
    exclude_device: Option<&str>,
    outcome: &SyncOutcome,
) {
    if outcome.persisted.is_empty() {
        return;
    }
    let message = ServerMessage::SyncDelta {
        operations: outcome.persisted.clone(),
        current_version: outcome.new_version,
        your_version: outcome.new_version,
    };
    let delivered = state
        .registry
        .broadcast_to_user(user_id, exclude_device, &message);
    debug!(
        "增量广播: user_id={}, ops={}, delivered={}",
        user_id,
        outcome.persisted.len(),
        delivered
    );
}

/// 落库并广播一条裁决产生的后续操作（通过的前向操作或拒绝的还原操作）
pub async fn apply_follow_up(
    state: &AppState,
    user_id: &str,
    op: SyncOperation,
    browser: Option<BrowserType>,
) -> Result<()> {
    // 游标取 i64::MAX（存储层以 i64 落列）令候选增量为空：
    // 后续操作不参与冲突检测，直接追加
    let source = op.source_device_id.clone();
    let outcome = state
        .processor
        .process(user_id, &source, vec![op], i64::MAX as u64, browser)
        .await?;
    broadcast_persisted(state, user_id, Some(source.as_str()), &outcome);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync::types::OpType;

    fn op(payload: OperationPayload) -> SyncOperation {
        SyncOperation::new("bm_1", payload, "dev_b")
    }

    #[test]
    fn test_submission_from_update_keeps_snapshot() {
        let s = submission_from_op(
            &op(OperationPayload::Update {
                title: Some("新".to_string()),
                url: Some("https://x.com".to_string()),
                previous_title: Some("旧".to_string()),
                previous_url: None,
            }),
            Some(BrowserType::Firefox),
        );
        assert_eq!(s.operation_type, OpType::Update);
        assert_eq!(s.url, "https://x.com");
        assert_eq!(s.previous_title.as_deref(), Some("旧"));
    }

    #[test]
    fn test_submission_from_move_uses_bookmark_id() {
        let s = submission_from_op(
            &op(OperationPayload::Move {
                old_parent: Some("f1".to_string()),
                new_parent: Some("f2".to_string()),
                old_index: Some(0),
                new_index: Some(3),
            }),
            Some(BrowserType::Chrome),
        );
        assert_eq!(s.url, "bm_1");
        assert_eq!(s.parent_id.as_deref(), Some("f2"));
    }

    #[tokio::test]
    async fn test_gate_splits_destructive_ops_from_non_canonical() {
        let state = AppState::for_test();
        state
            .moderation
            .set_canonical_device("u1", "dev_a")
            .await
            .unwrap();

        let ops = vec![
            op(OperationPayload::Add {
                title: "t".to_string(),
                url: "https://a.com".to_string(),
                folder_path: None,
                folder_type: None,
            }),
            op(OperationPayload::Delete {
                url: Some("https://b.com".to_string()),
                title: None,
            }),
        ];
        let result = submit_operations(&state, "u1", "dev_b", Some(BrowserType::Chrome), ops, 0)
            .await
            .unwrap();

        // ADD 直接落库，DELETE 进审核队列
        assert_eq!(result.outcome.persisted.len(), 1);
        assert_eq!(result.queued.len(), 1);
        assert_eq!(result.queued[0].op_type, OpType::Delete);
    }

    #[tokio::test]
    async fn test_gate_records_absent_browser_as_unknown() {
        let state = AppState::for_test();
        state
            .moderation
            .set_canonical_device("u1", "dev_a")
            .await
            .unwrap();

        let ops = vec![op(OperationPayload::Delete {
            url: Some("https://b.com".to_string()),
            title: None,
        })];
        // 未携带 x-browser-type 的提交不得被记成某个具体浏览器
        let result = submit_operations(&state, "u1", "dev_b", None, ops, 0)
            .await
            .unwrap();
        assert_eq!(result.queued.len(), 1);
        assert_eq!(result.queued[0].browser, None);
    }

    #[tokio::test]
    async fn test_canonical_device_bypasses_gate() {
        let state = AppState::for_test();
        state
            .moderation
            .set_canonical_device("u1", "dev_a")
            .await
            .unwrap();

        let ops = vec![op(OperationPayload::Delete {
            url: Some("https://b.com".to_string()),
            title: None,
        })];
        let result = submit_operations(&state, "u1", "dev_a", None, ops, 0)
            .await
            .unwrap();
        assert!(result.queued.is_empty());
        assert_eq!(result.outcome.persisted.len(), 1);
    }

    #[tokio::test]
    async fn test_no_canonical_means_no_gate() {
        let state = AppState::for_test();
        let ops = vec![op(OperationPayload::Delete {
            url: Some("https://b.com".to_string()),
            title: None,
        })];
        let result = submit_operations(&state, "u1", "dev_b", None, ops, 0)
            .await
            .unwrap();
        assert!(result.queued.is_empty());
        assert_eq!(result.outcome.persisted.len(), 1);
    }
}
