//! 服务端共享状态与配置

use std::sync::Arc;

use marksync::moderation::{ModerationManager, ModerationPolicy};
use marksync::store::SqliteStore;
use marksync::sync::SyncProcessor;
use marksync::{ConnectionRegistry, MarksyncError, Result};

/// 服务端配置（全部来自环境变量）
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_addr: String,
    /// SQLite 数据库路径，`:memory:` 表示内存库
    pub db_path: String,
    /// 共享鉴权令牌，为空则跳过令牌校验（仅限本机调试）
    pub token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            std::env::var("MARKSYNC_BIND").unwrap_or_else(|_| "0.0.0.0:8787".to_string());
        let db_path =
            std::env::var("MARKSYNC_DB").unwrap_or_else(|_| "./marksync.db".to_string());
        let token = match std::env::var("MARKSYNC_TOKEN") {
            Ok(t) if !t.is_empty() => Some(t),
            _ => None,
        };
        if bind_addr.is_empty() {
            return Err(MarksyncError::Config("MARKSYNC_BIND 不能为空".to_string()));
        }
        Ok(Self {
            bind_addr,
            db_path,
            token,
        })
    }
}

/// 各路由共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<SqliteStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub processor: Arc<SyncProcessor<SqliteStore>>,
    pub moderation: Arc<ModerationManager<SqliteStore>>,
}

impl AppState {
    pub fn from_config(config: Arc<ServerConfig>) -> Result<Self> {
        let store = if config.db_path == ":memory:" {
            Arc::new(SqliteStore::in_memory()?)
        } else {
            Arc::new(SqliteStore::open(&config.db_path)?)
        };
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            processor: Arc::new(SyncProcessor::new(Arc::clone(&store))),
            moderation: Arc::new(ModerationManager::new(
                Arc::clone(&store),
                ModerationPolicy::DestructiveOnly,
            )),
            store,
            config,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        let config = Arc::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: ":memory:".to_string(),
            token: Some("test-token".to_string()),
        });
        Self::from_config(config).expect("test state")
    }
}
