//! 操作去重管理器
//!
//! 基于操作 ID 的 TTL 缓存，用于回声抑制：守护进程把自己发出的操作
//! 记下来，收到服务端增量时跳过自己发出的那些，防止本地重复应用。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// 已见操作集合（操作 ID -> 记录时间）
pub struct DeduplicationManager {
    seen: Mutex<HashMap<String, Instant>>,
    /// 记录保留时间
    retention: Duration,
    /// 超过此条数时在写入路径上顺带清理
    cleanup_threshold: usize,
}

impl DeduplicationManager {
    pub fn new() -> Self {
        // 保留 10 分钟足够覆盖一轮断线重连加补拉
        Self::with_config(Duration::from_secs(600), 10_000)
    }

    pub fn with_config(retention: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            retention,
            cleanup_threshold: max_entries * 4 / 5,
        }
    }

    /// 该操作是否已经见过
    pub fn is_duplicate(&self, op_id: &str) -> bool {
        let seen = self.seen.lock();
        if seen.contains_key(op_id) {
            debug!("检测到重复操作: op_id={}", op_id);
            return true;
        }
        false
    }

    /// 标记操作为已见
    pub fn mark_seen(&self, op_id: &str) {
        let mut seen = self.seen.lock();
        seen.insert(op_id.to_string(), Instant::now());
        if seen.len() > self.cleanup_threshold {
            self.sweep_locked(&mut seen);
        }
    }

    fn sweep_locked(&self, seen: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) <= self.retention);
        let removed = before - seen.len();
        if removed > 0 {
            info!("清理过期去重记录: 移除 {} 条，剩余 {} 条", removed, seen.len());
        }
    }

    /// 清理过期记录
    pub fn sweep(&self) {
        let mut seen = self.seen.lock();
        self.sweep_locked(&mut seen);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
        info!("去重缓存已清空");
    }
}

impl Default for DeduplicationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_seen_then_duplicate() {
        let manager = DeduplicationManager::new();

        assert!(!manager.is_duplicate("op1"));
        manager.mark_seen("op1");
        assert!(manager.is_duplicate("op1"));
        assert!(!manager.is_duplicate("op2"));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let manager = DeduplicationManager::with_config(Duration::from_millis(50), 100);
        manager.mark_seen("op1");
        manager.mark_seen("op2");
        assert_eq!(manager.len(), 2);

        thread::sleep(Duration::from_millis(120));
        manager.sweep();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_write_path_triggers_cleanup() {
        let manager = DeduplicationManager::with_config(Duration::from_millis(10), 5);
        for i in 0..4 {
            manager.mark_seen(&format!("op{}", i));
        }
        thread::sleep(Duration::from_millis(30));
        // 第 5 条写入跨过阈值，顺带清掉过期的前 4 条
        manager.mark_seen("op_fresh");
        assert_eq!(manager.len(), 1);
        assert!(manager.is_duplicate("op_fresh"));
    }
}
