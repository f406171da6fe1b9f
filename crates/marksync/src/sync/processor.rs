//! 同步处理器
//!
//! 契约：给定 (user_id, device_id, operations, last_sync_version)，
//! 返回 (accepted, delta, new_version, conflicts)。
//!
//! 算法：
//! 1. 取出该用户其他设备产生、版本大于游标的已落库操作（候选增量），
//!    按版本升序；
//! 2. 每条入站操作在候选增量中找指向同一逻辑书签的操作（bookmark_id
//!    或归一化 URL 命中即算），命中即为冲突：时间戳更大者获胜，无论
//!    胜负都记一条冲突记录；
//! 3. 冲突落败的入站操作不落库（远端状态保留）；其余入站操作以本批
//!    新铸的同一版本号落库；
//! 4. 候选增量中输给入站操作的条目从出站增量中剔除；
//! 5. 返回过滤后的增量与新版本号，客户端以其为新的 last_sync_version。
//!
//! 读-判-写序列必须按用户串行：两个并发请求若都读到同一游标快照，
//! 可能对同一冲突各自判胜，破坏至多一个胜者的约束。这里用每用户
//! try_lock，占不到锁直接报"同步进行中"，绝不交错执行。
//!
//! 平手裁决是刻意的简化：完全信任设备时钟的 last-write-wins。
//! 时间戳相等时视为入站方没有更新，已落库一侧获胜，保证与到达顺序
//! 无关的确定性。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, MarksyncError, Result};
use crate::store::OperationStore;
use crate::types::{
    BrowserType, Conflict, ConflictResolution, PersistedOperation, SyncOperation,
};

/// 一次同步的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub accepted: bool,
    /// 发给该设备的增量（已剔除被入站操作击败的条目）
    pub delta: Vec<PersistedOperation>,
    /// 设备应记住的新游标
    pub new_version: u64,
    pub conflicts: Vec<Conflict>,
    /// 本批实际落库的操作（供调用方向其他设备广播）
    #[serde(skip)]
    pub persisted: Vec<PersistedOperation>,
}

/// 每用户版本计数器
///
/// 首次使用时以日志中的最大版本播种，此后单调递增，彻底避开
/// 墙钟时间做排序键带来的碰撞与回退问题。
struct VersionCounter {
    seeded: bool,
    current: u64,
}

/// 同步处理器
pub struct SyncProcessor<S> {
    store: Arc<S>,
    /// 每用户一把锁，锁内附版本计数器
    user_states: Mutex<HashMap<String, Arc<Mutex<VersionCounter>>>>,
}

/// 同步锁守卫：持有期间该用户的同步提交一律得到 `SyncInProgress`
pub struct SyncGuard {
    _counter: tokio::sync::OwnedMutexGuard<VersionCounter>,
}

impl<S: OperationStore> SyncProcessor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            user_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// 处理一批入站操作并计算增量
    ///
    /// 同一用户已有同步在进行时直接报 `SyncInProgress`，不排队等待。
    pub async fn process(
        &self,
        user_id: &str,
        device_id: &str,
        operations: Vec<SyncOperation>,
        last_sync_version: u64,
        browser: Option<BrowserType>,
    ) -> Result<SyncOutcome> {
        let state = self.user_state(user_id).await;
        let mut counter = state.try_lock().map_err(|_| {
            warn!("拒绝交错同步: user_id={}, device_id={}", user_id, device_id);
            MarksyncError::protocol(
                ErrorCode::SyncInProgress,
                format!("用户 {} 的同步正在进行中", user_id),
            )
        })?;

        if !counter.seeded {
            counter.current = self.store.max_version(user_id).await?;
            counter.seeded = true;
            debug!("版本计数器播种: user_id={}, current={}", user_id, counter.current);
        }

        // 1. 候选增量
        let candidates = self
            .store
            .operations_after(user_id, device_id, last_sync_version)
            .await?;

        // 2/3. 冲突检测与裁决
        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut beaten_candidates: HashSet<String> = HashSet::new();
        let mut to_persist: Vec<SyncOperation> = Vec::new();

        for op in operations {
            match candidates.iter().find(|c| c.op.same_bookmark(&op)) {
                Some(candidate) => {
                    // 时间戳严格更大才算入站获胜；相等时已落库一侧保留
                    let local_wins = op.timestamp > candidate.op.timestamp;
                    let resolution = if local_wins {
                        ConflictResolution::LocalWins
                    } else {
                        ConflictResolution::RemoteWins
                    };
                    debug!(
                        "检测到冲突: bookmark={}, local_ts={}, remote_ts={}, resolution={:?}",
                        op.bookmark_id, op.timestamp, candidate.op.timestamp, resolution
                    );
                    conflicts.push(Conflict::new(op.clone(), candidate.clone(), resolution));

                    if local_wins {
                        beaten_candidates.insert(candidate.op.id.clone());
                        to_persist.push(op);
                    }
                }
                None => to_persist.push(op),
            }
        }

        // 落库：本批共用一个新铸版本号
        let mut persisted = Vec::new();
        let new_version = if to_persist.is_empty() {
            counter.current
        } else {
            counter.current += 1;
            let version = counter.current;
            self.store
                .append_operations(user_id, &to_persist, version, browser)
                .await?;
            persisted = to_persist
                .into_iter()
                .map(|op| PersistedOperation {
                    version,
                    op,
                    browser,
                })
                .collect();
            version
        };

        // 4. 出站增量剔除落败候选
        let delta: Vec<PersistedOperation> = candidates
            .into_iter()
            .filter(|c| !beaten_candidates.contains(&c.op.id))
            .collect();

        info!(
            "同步完成: user_id={}, device_id={}, persisted={}, delta={}, conflicts={}, new_version={}",
            user_id,
            device_id,
            persisted.len(),
            delta.len(),
            conflicts.len(),
            new_version
        );

        Ok(SyncOutcome {
            accepted: true,
            delta,
            new_version,
            conflicts,
            persisted,
        })
    }

    /// 仅计算增量，不提交任何操作（CHECK_IN 对账路径）
    pub async fn delta_for(
        &self,
        user_id: &str,
        device_id: &str,
        last_sync_version: u64,
    ) -> Result<SyncOutcome> {
        self.process(user_id, device_id, Vec::new(), last_sync_version, None)
            .await
    }

    /// 当前版本号（未播种时查日志）
    pub async fn current_version(&self, user_id: &str) -> Result<u64> {
        let state = self.user_state(user_id).await;
        let counter = state.lock().await;
        if counter.seeded {
            Ok(counter.current)
        } else {
            self.store.max_version(user_id).await
        }
    }

    /// 占住某用户的同步锁（维护窗口：挡住该用户的一切同步提交）
    pub async fn suspend_user(&self, user_id: &str) -> SyncGuard {
        let state = self.user_state(user_id).await;
        SyncGuard {
            _counter: state.lock_owned().await,
        }
    }

    async fn user_state(&self, user_id: &str) -> Arc<Mutex<VersionCounter>> {
        let mut states = self.user_states.lock().await;
        states
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(VersionCounter {
                    seeded: false,
                    current: 0,
                }))
            })
            .clone()
    }
}
