//! SQLite 操作日志存储
//!
//! 表结构幂等创建。操作负载整体存 JSON 列，便于模式演进；
//! 操作类型、URL、时间戳等冗余成独立列用于过滤查询。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use tracing::info;

use crate::error::{MarksyncError, Result};
use crate::store::{ActivityFilter, ActivityPage, OperationStore};
use crate::types::{BrowserType, PersistedOperation, SyncOperation};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

/// SQLite 存储实现
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("操作日志数据库已就绪: {}", path.as_ref().display());
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// 创建表结构（幂等）
    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_operation (
                rowid_pk INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                op_type TEXT NOT NULL,
                bookmark_id TEXT NOT NULL,
                url TEXT,
                payload TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                source_device_id TEXT NOT NULL,
                browser TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (user_id, op_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sync_operation_cursor
                ON sync_operation (user_id, version);
            CREATE INDEX IF NOT EXISTS idx_sync_operation_device
                ON sync_operation (user_id, source_device_id);

            CREATE TABLE IF NOT EXISTS canonical_device (
                user_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_persisted(row: &Row<'_>) -> rusqlite::Result<(u64, String, Option<String>)> {
        Ok((
            row.get::<_, i64>(0)? as u64,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    }

    fn parse_persisted(
        version: u64,
        payload: String,
        browser: Option<String>,
    ) -> Result<PersistedOperation> {
        let op: SyncOperation = serde_json::from_str(&payload)?;
        let browser = match browser {
            Some(tag) => Some(BrowserType::parse(&tag)?),
            None => None,
        };
        Ok(PersistedOperation { version, op, browser })
    }
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn append_operations(
        &self,
        user_id: &str,
        operations: &[SyncOperation],
        version: u64,
        browser: Option<BrowserType>,
    ) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().timestamp_millis();

        for op in operations {
            let payload = serde_json::to_string(op)?;
            // 操作 id 全局唯一且不可变，重复提交幂等忽略
            tx.execute(
                r#"INSERT OR IGNORE INTO sync_operation (
                    op_id, user_id, version, op_type, bookmark_id, url,
                    payload, timestamp, source_device_id, browser, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                params![
                    op.id,
                    user_id,
                    version as i64,
                    op.op_type().as_str(),
                    op.bookmark_id,
                    op.payload.url(),
                    payload,
                    op.timestamp,
                    op.source_device_id,
                    browser.map(|b| b.as_str()),
                    now,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn operations_after(
        &self,
        user_id: &str,
        exclude_device_id: &str,
        after_version: u64,
    ) -> Result<Vec<PersistedOperation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT version, payload, browser FROM sync_operation
               WHERE user_id = ?1 AND source_device_id != ?2 AND version > ?3
               ORDER BY version ASC, rowid_pk ASC"#,
        )?;

        let rows = stmt.query_map(
            params![user_id, exclude_device_id, after_version as i64],
            Self::row_to_persisted,
        )?;

        let mut operations = Vec::new();
        for row in rows {
            let (version, payload, browser) = row?;
            operations.push(Self::parse_persisted(version, payload, browser)?);
        }
        Ok(operations)
    }

    async fn max_version(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM sync_operation WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    async fn clear_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sync_operation WHERE user_id = ?1",
            params![user_id],
        )?;
        info!("已清空用户操作日志: user_id={}, removed={}", user_id, removed);
        Ok(removed)
    }

    async fn activity(&self, user_id: &str, filter: &ActivityFilter) -> Result<ActivityPage> {
        let page = filter.page.unwrap_or(1).max(1);
        let page_size = filter
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        // 动态拼接过滤条件，参数统一走绑定避免注入
        let mut clauses = vec!["user_id = ?1".to_string()];
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(action) = filter.action {
            params_vec.push(Box::new(action.as_str().to_string()));
            clauses.push(format!("op_type = ?{}", params_vec.len()));
        }
        if let Some(browser) = filter.browser {
            params_vec.push(Box::new(browser.as_str().to_string()));
            clauses.push(format!("browser = ?{}", params_vec.len()));
        }
        if let Some(from) = filter.from {
            params_vec.push(Box::new(from));
            clauses.push(format!("timestamp >= ?{}", params_vec.len()));
        }
        if let Some(to) = filter.to {
            params_vec.push(Box::new(to));
            clauses.push(format!("timestamp <= ?{}", params_vec.len()));
        }

        let where_clause = clauses.join(" AND ");
        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sync_operation WHERE {}", where_clause),
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let offset = (page - 1) as i64 * page_size as i64;
        let sql = format!(
            r#"SELECT version, payload, browser FROM sync_operation
               WHERE {} ORDER BY version DESC, rowid_pk DESC
               LIMIT {} OFFSET {}"#,
            where_clause, page_size, offset
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            Self::row_to_persisted,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (version, payload, browser) = row?;
            entries.push(Self::parse_persisted(version, payload, browser)?);
        }

        Ok(ActivityPage {
            entries,
            total: total as u64,
            page,
            page_size,
        })
    }

    async fn canonical_device(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                "SELECT device_id FROM canonical_device WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(MarksyncError::from(other)),
            })?;
        Ok(device)
    }

    async fn set_canonical_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO canonical_device (user_id, device_id, updated_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT (user_id) DO UPDATE SET
                   device_id = excluded.device_id,
                   updated_at = excluded.updated_at"#,
            params![user_id, device_id, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}
