//! 审核工作流（主控设备裁决）
//!
//! 每用户唯一一台"主控"设备：其余设备提交的受审操作不直接生效，
//! 先进入待审队列等人工裁决。通过则向日志追加一条同类型的前向操作，
//! 让全体设备收敛到被批准的值；拒绝则合成一条还原操作，把提交设备
//! 拉回主控侧状态：
//! - 被拒的 ADD → 同书签的 DELETE；
//! - 被拒的 UPDATE → 用入队时保存的修改前快照合成还原 UPDATE；
//! - 被拒的 DELETE → 无需还原（日志里从未删除）。
//!
//! 待审队列与主控指定都是进程内按用户加锁的状态；主控指定额外落键值
//! 表以跨重启保留，待审队列随进程消亡（承重不变量：日志跨重启存活，
//! 队列与连接注册表不存活）。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, MarksyncError, Result};
use crate::store::OperationStore;
use crate::types::{
    normalize_url, BrowserType, ModerationStatus, OpType, OperationPayload, PendingModeration,
    SyncOperation,
};

/// 审核策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationPolicy {
    /// 仅破坏性操作（UPDATE/DELETE/MOVE）受审，ADD 直接生效
    DestructiveOnly,
    /// 非主控设备的一切操作都受审
    All,
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        ModerationPolicy::DestructiveOnly
    }
}

/// 受审操作的提交内容
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationSubmission {
    pub operation_type: OpType,
    /// 提交方浏览器；助手未声明时保持缺省，不猜测
    #[serde(default)]
    pub browser: Option<BrowserType>,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub previous_title: Option<String>,
    #[serde(default)]
    pub previous_url: Option<String>,
    #[serde(default)]
    pub bookmark_id: Option<String>,
}

/// 单条裁决结果
#[derive(Debug, Clone)]
pub struct ModerationDecision {
    /// 已出队的条目（状态已改为 accepted/rejected）
    pub entry: PendingModeration,
    /// 需要追加进日志的后续操作：通过为前向操作，拒绝为还原操作，
    /// 被拒的 DELETE 则为 None
    pub follow_up: Option<SyncOperation>,
}

struct UserModeration {
    canonical_device_id: Option<String>,
    canonical_loaded: bool,
    pending: Vec<PendingModeration>,
}

/// 审核管理器
pub struct ModerationManager<S> {
    store: Arc<S>,
    policy: ModerationPolicy,
    states: Mutex<HashMap<String, Arc<Mutex<UserModeration>>>>,
}

impl<S: OperationStore> ModerationManager<S> {
    pub fn new(store: Arc<S>, policy: ModerationPolicy) -> Self {
        Self {
            store,
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// 判断某操作是否需要送审
    pub fn requires_moderation(&self, op_type: OpType) -> bool {
        match self.policy {
            ModerationPolicy::All => true,
            ModerationPolicy::DestructiveOnly => op_type.is_destructive(),
        }
    }

    /// 读取主控设备（内存未加载时回源键值表）
    pub async fn canonical_device(&self, user_id: &str) -> Result<Option<String>> {
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        if !state.canonical_loaded {
            state.canonical_device_id = self.store.canonical_device(user_id).await?;
            state.canonical_loaded = true;
        }
        Ok(state.canonical_device_id.clone())
    }

    /// 指定主控设备（静默覆盖旧值，是否先行确认属 UI 层职责）
    pub async fn set_canonical_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        self.store.set_canonical_device(user_id, device_id).await?;
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        if let Some(previous) = state.canonical_device_id.as_deref() {
            if previous != device_id {
                info!(
                    "主控设备易主: user_id={}, {} -> {}",
                    user_id, previous, device_id
                );
            }
        }
        state.canonical_device_id = Some(device_id.to_string());
        state.canonical_loaded = true;
        Ok(())
    }

    /// 某设备是否为主控
    pub async fn is_canonical(&self, user_id: &str, device_id: &str) -> Result<bool> {
        Ok(self
            .canonical_device(user_id)
            .await?
            .as_deref()
            .map(|canonical| canonical == device_id)
            .unwrap_or(false))
    }

    /// 操作入队待审
    ///
    /// 按 (归一化 URL, 操作类型) 去重：同一逻辑变更重复提交时合并进
    /// 已有条目——UPDATE 以最新 title/url 覆盖，但保留最早的修改前
    /// 快照，保证之后的拒绝仍能正确还原。
    pub async fn queue(
        &self,
        user_id: &str,
        device_id: &str,
        submission: ModerationSubmission,
    ) -> Result<PendingModeration> {
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;

        let key_url = normalize_url(&submission.url);
        if let Some(existing) = state.pending.iter_mut().find(|entry| {
            entry.op_type == submission.operation_type && normalize_url(&entry.url) == key_url
        }) {
            debug!(
                "合并重复待审条目: user_id={}, url={}, op_type={}",
                user_id, existing.url, existing.op_type
            );
            existing.title = submission.title.or(existing.title.take());
            existing.browser = submission.browser.or(existing.browser.take());
            existing.url = submission.url;
            existing.folder_path = submission.folder_path.or(existing.folder_path.take());
            existing.parent_id = submission.parent_id.or(existing.parent_id.take());
            // 修改前快照保持首次入队的值不动
            existing.device_id = device_id.to_string();
            existing.queued_at = Utc::now().timestamp_millis();
            return Ok(existing.clone());
        }

        let entry = PendingModeration {
            id: Uuid::new_v4().to_string(),
            op_type: submission.operation_type,
            browser: submission.browser,
            url: submission.url,
            title: submission.title,
            folder_path: submission.folder_path,
            parent_id: submission.parent_id,
            previous_title: submission.previous_title,
            previous_url: submission.previous_url,
            bookmark_id: submission.bookmark_id,
            device_id: device_id.to_string(),
            status: ModerationStatus::Pending,
            queued_at: Utc::now().timestamp_millis(),
        };
        info!(
            "操作入队待审: user_id={}, id={}, op_type={}, url={}",
            user_id, entry.id, entry.op_type, entry.url
        );
        state.pending.push(entry.clone());
        Ok(entry)
    }

    /// 当前待审列表快照
    pub async fn pending(&self, user_id: &str) -> Vec<PendingModeration> {
        let state = self.user_state(user_id).await;
        let state = state.lock().await;
        state.pending.clone()
    }

    /// 通过单条待审操作
    pub async fn accept(&self, user_id: &str, entry_id: &str) -> Result<ModerationDecision> {
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        let entry = Self::take_entry(&mut state.pending, entry_id)?;
        Ok(Self::decide(entry, true))
    }

    /// 拒绝单条待审操作
    pub async fn reject(&self, user_id: &str, entry_id: &str) -> Result<ModerationDecision> {
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        let entry = Self::take_entry(&mut state.pending, entry_id)?;
        Ok(Self::decide(entry, false))
    }

    /// 批量通过：对待审集合做快照后清空，再逐条处理快照
    pub async fn accept_all(&self, user_id: &str) -> Vec<ModerationDecision> {
        self.drain_all(user_id, true).await
    }

    /// 批量拒绝
    pub async fn reject_all(&self, user_id: &str) -> Vec<ModerationDecision> {
        self.drain_all(user_id, false).await
    }

    /// 裁决的后续操作落库失败时，把条目放回待审队列
    ///
    /// 状态复位为 pending，同一裁决动作可安全重试。
    pub async fn restore(&self, user_id: &str, entries: Vec<PendingModeration>) {
        if entries.is_empty() {
            return;
        }
        warn!(
            "裁决未完成，条目回队: user_id={}, count={}",
            user_id,
            entries.len()
        );
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        for mut entry in entries {
            entry.status = ModerationStatus::Pending;
            state.pending.push(entry);
        }
    }

    async fn drain_all(&self, user_id: &str, accept: bool) -> Vec<ModerationDecision> {
        let state = self.user_state(user_id).await;
        let mut state = state.lock().await;
        let snapshot = std::mem::take(&mut state.pending);
        info!(
            "批量裁决: user_id={}, count={}, accept={}",
            user_id,
            snapshot.len(),
            accept
        );
        snapshot
            .into_iter()
            .map(|entry| Self::decide(entry, accept))
            .collect()
    }

    fn take_entry(
        pending: &mut Vec<PendingModeration>,
        entry_id: &str,
    ) -> Result<PendingModeration> {
        // 找不到条目时不动队列，调用方可安全重试
        let index = pending
            .iter()
            .position(|entry| entry.id == entry_id)
            .ok_or_else(|| {
                warn!("裁决目标不存在: id={}", entry_id);
                MarksyncError::protocol(
                    ErrorCode::NotFound,
                    format!("待审条目不存在: {}", entry_id),
                )
            })?;
        Ok(pending.remove(index))
    }

    fn decide(mut entry: PendingModeration, accept: bool) -> ModerationDecision {
        entry.status = if accept {
            ModerationStatus::Accepted
        } else {
            ModerationStatus::Rejected
        };
        let follow_up = if accept {
            Some(Self::forward_operation(&entry))
        } else {
            Self::reversal_operation(&entry)
        };
        ModerationDecision { entry, follow_up }
    }

    /// 通过后追加的前向操作（与原提交同类型，让其他设备收敛）
    fn forward_operation(entry: &PendingModeration) -> SyncOperation {
        let bookmark_id = Self::bookmark_id_of(entry);
        let payload = match entry.op_type {
            OpType::Add => OperationPayload::Add {
                title: entry.title.clone().unwrap_or_default(),
                url: entry.url.clone(),
                folder_path: entry.folder_path.clone(),
                folder_type: None,
            },
            OpType::Update => OperationPayload::Update {
                title: entry.title.clone(),
                url: Some(entry.url.clone()),
                previous_title: entry.previous_title.clone(),
                previous_url: entry.previous_url.clone(),
            },
            OpType::Delete => OperationPayload::Delete {
                url: Some(entry.url.clone()),
                title: entry.title.clone(),
            },
            OpType::Move => OperationPayload::Move {
                old_parent: None,
                new_parent: entry.parent_id.clone(),
                old_index: None,
                new_index: None,
            },
        };
        // 提交设备本地已生效，前向操作以它为来源，增量自然跳过它
        SyncOperation::new(bookmark_id, payload, entry.device_id.clone())
    }

    /// 拒绝后追加的还原操作
    fn reversal_operation(entry: &PendingModeration) -> Option<SyncOperation> {
        let bookmark_id = Self::bookmark_id_of(entry);
        let payload = match entry.op_type {
            // 被拒的 ADD：删掉该书签
            OpType::Add => OperationPayload::Delete {
                url: Some(entry.url.clone()),
                title: entry.title.clone(),
            },
            // 被拒的 UPDATE：用修改前快照还原
            OpType::Update => OperationPayload::Update {
                title: entry.previous_title.clone(),
                url: entry.previous_url.clone().or(Some(entry.url.clone())),
                previous_title: entry.title.clone(),
                previous_url: Some(entry.url.clone()),
            },
            // 被拒的 DELETE：日志从未删除，无需还原
            OpType::Delete => return None,
            // 被拒的 MOVE：移回原位（原位未知时退化为无动作）
            OpType::Move => return None,
        };
        // 还原操作必须送达提交设备本身，来源标记为裁决方
        Some(SyncOperation::new(bookmark_id, payload, "canonical"))
    }

    fn bookmark_id_of(entry: &PendingModeration) -> String {
        entry
            .bookmark_id
            .clone()
            .unwrap_or_else(|| format!("bm:{}", normalize_url(&entry.url)))
    }

    async fn user_state(&self, user_id: &str) -> Arc<Mutex<UserModeration>> {
        let mut states = self.states.lock().await;
        states
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(UserModeration {
                    canonical_device_id: None,
                    canonical_loaded: false,
                    pending: Vec::new(),
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn manager() -> ModerationManager<SqliteStore> {
        ModerationManager::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            ModerationPolicy::DestructiveOnly,
        )
    }

    fn submission(op_type: OpType, url: &str) -> ModerationSubmission {
        ModerationSubmission {
            operation_type: op_type,
            browser: Some(BrowserType::Firefox),
            url: url.to_string(),
            title: Some("标题".to_string()),
            folder_path: None,
            parent_id: None,
            previous_title: None,
            previous_url: None,
            bookmark_id: None,
        }
    }

    #[tokio::test]
    async fn test_canonical_assignment_replaces_silently() {
        let m = manager();
        assert_eq!(m.canonical_device("u1").await.unwrap(), None);

        m.set_canonical_device("u1", "dev_a").await.unwrap();
        assert!(m.is_canonical("u1", "dev_a").await.unwrap());

        m.set_canonical_device("u1", "dev_b").await.unwrap();
        assert!(!m.is_canonical("u1", "dev_a").await.unwrap());
        assert!(m.is_canonical("u1", "dev_b").await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_classes() {
        let m = manager();
        assert!(!m.requires_moderation(OpType::Add));
        assert!(m.requires_moderation(OpType::Update));
        assert!(m.requires_moderation(OpType::Delete));
        assert!(m.requires_moderation(OpType::Move));
    }

    #[tokio::test]
    async fn test_queue_dedup_preserves_original_snapshot() {
        let m = manager();
        let first = ModerationSubmission {
            previous_title: Some("原标题".to_string()),
            title: Some("改一".to_string()),
            ..submission(OpType::Update, "https://x.com")
        };
        m.queue("u1", "dev_b", first).await.unwrap();

        // 同一逻辑变更再次提交：合并而非新增
        let second = ModerationSubmission {
            previous_title: Some("改一".to_string()),
            title: Some("改二".to_string()),
            ..submission(OpType::Update, "https://x.com")
        };
        m.queue("u1", "dev_b", second).await.unwrap();

        let pending = m.pending("u1").await;
        assert_eq!(pending.len(), 1);
        // 最新值覆盖，修改前快照保留首次入队的值
        assert_eq!(pending[0].title.as_deref(), Some("改二"));
        assert_eq!(pending[0].previous_title.as_deref(), Some("原标题"));
    }

    #[tokio::test]
    async fn test_reject_add_yields_delete_reversal() {
        let m = manager();
        let entry = m
            .queue("u1", "dev_b", submission(OpType::Add, "https://x.com"))
            .await
            .unwrap();

        let decision = m.reject("u1", &entry.id).await.unwrap();
        assert_eq!(decision.entry.status, ModerationStatus::Rejected);
        let reversal = decision.follow_up.expect("ADD 被拒应有还原操作");
        match reversal.payload {
            OperationPayload::Delete { ref url, .. } => {
                assert_eq!(url.as_deref(), Some("https://x.com"));
            }
            ref other => panic!("期待 DELETE 还原，得到 {:?}", other),
        }
        assert!(m.pending("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_update_restores_previous_values() {
        let m = manager();
        let entry = m
            .queue(
                "u1",
                "dev_b",
                ModerationSubmission {
                    previous_title: Some("A".to_string()),
                    title: Some("B".to_string()),
                    ..submission(OpType::Update, "https://x.com")
                },
            )
            .await
            .unwrap();

        let decision = m.reject("u1", &entry.id).await.unwrap();
        match decision.follow_up.unwrap().payload {
            OperationPayload::Update { title, .. } => {
                assert_eq!(title.as_deref(), Some("A"));
            }
            other => panic!("期待还原 UPDATE，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reject_delete_needs_no_reversal() {
        let m = manager();
        let entry = m
            .queue("u1", "dev_b", submission(OpType::Delete, "https://x.com"))
            .await
            .unwrap();

        let decision = m.reject("u1", &entry.id).await.unwrap();
        assert!(decision.follow_up.is_none());
    }

    #[tokio::test]
    async fn test_accept_emits_forward_operation() {
        let m = manager();
        let entry = m
            .queue("u1", "dev_b", submission(OpType::Delete, "https://x.com"))
            .await
            .unwrap();

        let decision = m.accept("u1", &entry.id).await.unwrap();
        assert_eq!(decision.entry.status, ModerationStatus::Accepted);
        let forward = decision.follow_up.expect("通过应有前向操作");
        assert_eq!(forward.op_type(), OpType::Delete);
        assert_eq!(forward.source_device_id, "dev_b");
    }

    #[tokio::test]
    async fn test_decide_unknown_id_leaves_queue_untouched() {
        let m = manager();
        m.queue("u1", "dev_b", submission(OpType::Delete, "https://x.com"))
            .await
            .unwrap();

        let err = m.accept("u1", "no_such_id").await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NotFound);
        // 失败不动队列，动作可安全重试
        assert_eq!(m.pending("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_resets_status_and_requeues() {
        let m = manager();
        let entry = m
            .queue("u1", "dev_b", submission(OpType::Delete, "https://x.com"))
            .await
            .unwrap();

        let decision = m.accept("u1", &entry.id).await.unwrap();
        assert!(m.pending("u1").await.is_empty());

        // 后续操作落库失败的善后路径：条目放回队列，状态复位
        m.restore("u1", vec![decision.entry]).await;
        let pending = m.pending("u1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, ModerationStatus::Pending);

        // 同一条目可再次裁决
        m.accept("u1", &entry.id).await.unwrap();
        assert!(m.pending("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_keeps_browser_unknown_when_absent() {
        let m = manager();
        let entry = m
            .queue(
                "u1",
                "dev_b",
                ModerationSubmission {
                    browser: None,
                    ..submission(OpType::Delete, "https://x.com")
                },
            )
            .await
            .unwrap();
        // 未声明的浏览器保持缺省，不落成某个具体值
        assert_eq!(entry.browser, None);
    }

    #[tokio::test]
    async fn test_bulk_reject_clears_then_processes() {
        let m = manager();
        m.queue("u1", "dev_b", submission(OpType::Add, "https://1.com"))
            .await
            .unwrap();
        m.queue("u1", "dev_b", submission(OpType::Delete, "https://2.com"))
            .await
            .unwrap();

        let decisions = m.reject_all("u1").await;
        assert_eq!(decisions.len(), 2);
        assert!(m.pending("u1").await.is_empty());
        // ADD 被拒有还原，DELETE 被拒没有
        let reversals: Vec<_> = decisions
            .iter()
            .filter(|d| d.follow_up.is_some())
            .collect();
        assert_eq!(reversals.len(), 1);
    }
}
