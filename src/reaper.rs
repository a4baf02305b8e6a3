//! 临时目录清理：过期临时文件与被遗弃的分片上传会话。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, DirEntry};
use tracing::{debug, info, warn};

use crate::config::MULTIPART_DIR;
use crate::locking::{LockManager, session_lock_key};

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// 临时根目录下普通文件的保留时长。
    pub temp_retention: Duration,
    /// 分片会话目录无更新后的保留时长。
    pub multipart_expire: Duration,
}

/// 一次清理的结果统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub temp_files_removed: usize,
    pub sessions_removed: usize,
    pub sessions_skipped: usize,
}

#[derive(Debug)]
pub struct Reaper {
    temp_root: PathBuf,
    locks: Arc<LockManager>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(temp_root: PathBuf, locks: Arc<LockManager>, config: ReaperConfig) -> Self {
        Self {
            temp_root,
            locks,
            config,
        }
    }

    pub fn multipart_root(&self) -> PathBuf {
        self.temp_root.join(MULTIPART_DIR)
    }

    /// 以当前时间执行一次清理。
    pub async fn run(&self) -> SweepReport {
        self.sweep(SystemTime::now()).await
    }

    /// 以给定时间为基准执行两项互不依赖的清理。
    pub async fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        match self.sweep_temp_files(now).await {
            Ok(removed) => report.temp_files_removed = removed,
            Err(err) => warn!(error = %err, "temp file sweep failed"),
        }
        if let Err(err) = self.sweep_sessions(now, &mut report).await {
            warn!(error = %err, "multipart session sweep failed");
        }
        let pruned = self.locks.prune_idle().await;
        let lock_entries = self.locks.len().await;
        debug!(
            temp_files_removed = report.temp_files_removed,
            sessions_removed = report.sessions_removed,
            sessions_skipped = report.sessions_skipped,
            locks_pruned = pruned,
            lock_entries,
            "reaper run finished"
        );
        report
    }

    /// 删除临时根目录下（不递归）超过保留期的普通文件，目录跳过。
    async fn sweep_temp_files(&self, now: SystemTime) -> io::Result<usize> {
        if fs::metadata(&self.temp_root).await.is_err() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.temp_root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if self.sweep_temp_entry(&entry, now).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sweep_temp_entry(&self, entry: &DirEntry, now: SystemTime) -> bool {
        let Some(metadata) = entry_metadata(entry).await else {
            return false;
        };
        if metadata.is_dir() || !is_expired(&metadata, now, self.config.temp_retention) {
            return false;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = ?path, "removed stale temp file");
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(path = ?path, error = %err, "failed to remove stale temp file");
                false
            }
        }
    }

    /// 删除超过遗弃期的会话目录；正被写入或合并的会话留到下一轮。
    async fn sweep_sessions(&self, now: SystemTime, report: &mut SweepReport) -> io::Result<()> {
        let multipart_root = self.multipart_root();
        if fs::metadata(&multipart_root).await.is_err() {
            return Ok(());
        }
        let mut dir = fs::read_dir(&multipart_root).await?;
        while let Some(entry) = dir.next_entry().await? {
            self.sweep_session_entry(&entry, now, report).await;
        }
        Ok(())
    }

    async fn sweep_session_entry(&self, entry: &DirEntry, now: SystemTime, report: &mut SweepReport) {
        let Some(metadata) = entry_metadata(entry).await else {
            return;
        };
        if !metadata.is_dir() || !is_expired(&metadata, now, self.config.multipart_expire) {
            return;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(_guard) = self.locks.try_lock_exclusive(&session_lock_key(&name)).await else {
            debug!(upload_id = %name, "skip busy multipart session");
            report.sessions_skipped += 1;
            return;
        };
        let path = entry.path();
        match remove_session_dir(&path).await {
            Ok(()) => {
                info!(upload_id = %name, path = ?path, "removed abandoned multipart session");
                report.sessions_removed += 1;
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "failed to remove abandoned multipart session")
            }
        }
    }
}

/// 读取目录项元数据；列举后已被并发删除的条目直接跳过，其它错误记录后跳过。
async fn entry_metadata(entry: &DirEntry) -> Option<std::fs::Metadata> {
    match entry.metadata().await {
        Ok(metadata) => Some(metadata),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(path = ?entry.path(), error = %err, "failed to stat temp entry");
            None
        }
    }
}

async fn remove_session_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn is_expired(metadata: &std::fs::Metadata, now: SystemTime, window: Duration) -> bool {
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match now.duration_since(modified) {
        Ok(age) => age > window,
        Err(_) => false,
    }
}
