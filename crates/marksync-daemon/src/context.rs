//! 守护进程共享上下文

use std::sync::Arc;

use marksync::{ClientConfig, DeduplicationManager, HostReply, ReconnectingClient, Result};
use tokio::sync::broadcast;

use crate::cursor::CursorFile;

pub struct DaemonContext {
    pub config: ClientConfig,
    pub client: Arc<ReconnectingClient>,
    pub cursor: CursorFile,
    /// 回声抑制：记录本机发出的操作 id
    pub dedup: DeduplicationManager,
    /// 下行增量的扇出通道，每个助手连接各订阅一份
    pub delta_tx: broadcast::Sender<HostReply>,
}

impl DaemonContext {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Arc::new(ReconnectingClient::new(config.clone())?);
        let cursor = CursorFile::load(&config.data_dir)?;
        let (delta_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            client,
            cursor,
            dedup: DeduplicationManager::new(),
            delta_tx,
        })
    }
}
