//! 同步游标的本地持久化
//!
//! 游标（last_sync_version）记录本机已消化到的日志版本，写入数据目录
//! 下的单行文本文件。丢失或损坏时回退为 0，代价只是一次全量补拉。

use std::path::{Path, PathBuf};

use marksync::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

pub struct CursorFile {
    path: PathBuf,
    cached: Mutex<u64>,
}

impl CursorFile {
    pub fn load(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("cursor");
        let cached = match std::fs::read_to_string(&path) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(value) => value,
                Err(_) => {
                    warn!("游标文件损坏，回退为 0: {}", path.display());
                    0
                }
            },
            Err(_) => 0,
        };
        info!("游标加载: {} = {}", path.display(), cached);
        Ok(Self {
            path,
            cached: Mutex::new(cached),
        })
    }

    pub fn get(&self) -> u64 {
        *self.cached.lock()
    }

    /// 推进游标并落盘（只前进不后退）
    pub fn advance(&self, version: u64) -> Result<()> {
        let mut cached = self.cached.lock();
        if version <= *cached {
            return Ok(());
        }
        *cached = version;
        std::fs::write(&self.path, version.to_string())?;
        Ok(())
    }

    /// 整库重置后强制归零
    pub fn reset(&self) -> Result<()> {
        *self.cached.lock() = 0;
        std::fs::write(&self.path, "0")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::load(dir.path()).unwrap();
        assert_eq!(cursor.get(), 0);
    }

    #[test]
    fn test_advance_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::load(dir.path()).unwrap();
        cursor.advance(42).unwrap();

        let reloaded = CursorFile::load(dir.path()).unwrap();
        assert_eq!(reloaded.get(), 42);
    }

    #[test]
    fn test_advance_never_goes_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::load(dir.path()).unwrap();
        cursor.advance(10).unwrap();
        cursor.advance(5).unwrap();
        assert_eq!(cursor.get(), 10);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cursor"), "不是数字").unwrap();
        let cursor = CursorFile::load(dir.path()).unwrap();
        assert_eq!(cursor.get(), 0);
    }
}
