//! 内存读写锁：串行化同一会话或同一路径上的冲突操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time;

use crate::storage::normalize_relative;

/// 条目数达到该值时，新建条目前先清掉无人持有的条目。
const PRUNE_THRESHOLD: usize = 1024;

/// 等待锁超时。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

/// Manages asynchronous read/write locks keyed by session id or storage-relative path.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn entry(&self, key: String) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        if locks.len() >= PRUNE_THRESHOLD && !locks.contains_key(&key) {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 在超时时间内获取共享锁。
    pub async fn lock_shared_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockReadGuard<()>, LockTimeout> {
        let lock = self.entry(key.to_string()).await;
        time::timeout(timeout, lock.read_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 在超时时间内获取独占锁。
    pub async fn lock_exclusive_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<()>, LockTimeout> {
        let lock = self.entry(key.to_string()).await;
        time::timeout(timeout, lock.write_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 不等待地尝试获取独占锁，锁被占用时返回 None。
    pub async fn try_lock_exclusive(&self, key: &str) -> Option<OwnedRwLockWriteGuard<()>> {
        let lock = self.entry(key.to_string()).await;
        lock.try_write_owned().ok()
    }

    /// 当前锁条目数量。
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// 移除当前无人持有的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

/// 会话锁键。
pub fn session_lock_key(upload_id: &str) -> String {
    format!("session:{upload_id}")
}

/// 路径锁键，与数据目录解析使用同一规范化规则，同一目标总是得到同一个键。
pub fn path_lock_key(path: &str) -> String {
    let path = path.trim();
    match normalize_relative(path) {
        Ok(normalized) => format!("path:{}", normalized.to_string_lossy()),
        Err(_) => format!("path:{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_locks_coexist_but_block_exclusive() {
        let manager = LockManager::new();
        let key = session_lock_key("abc");
        let first = manager
            .lock_shared_with_timeout(&key, Duration::from_millis(50))
            .await
            .expect("first shared");
        let second = manager
            .lock_shared_with_timeout(&key, Duration::from_millis(50))
            .await
            .expect("second shared");

        assert!(manager.try_lock_exclusive(&key).await.is_none());
        assert_eq!(
            manager
                .lock_exclusive_with_timeout(&key, Duration::from_millis(20))
                .await
                .err(),
            Some(LockTimeout)
        );

        drop(first);
        drop(second);
        assert!(manager.try_lock_exclusive(&key).await.is_some());
    }

    #[tokio::test]
    async fn prune_idle_keeps_held_entries() {
        let manager = LockManager::new();
        let held = manager
            .try_lock_exclusive("held")
            .await
            .expect("lock held key");
        drop(manager.try_lock_exclusive("idle").await);

        assert_eq!(manager.prune_idle().await, 1);
        assert!(manager.try_lock_exclusive("held").await.is_none());
        drop(held);
        assert_eq!(manager.prune_idle().await, 1);
    }

    #[tokio::test]
    async fn idle_entries_are_pruned_once_map_is_large() {
        let manager = LockManager::new();
        let held = manager
            .try_lock_exclusive("held")
            .await
            .expect("lock held key");
        for index in 0..(PRUNE_THRESHOLD * 3) {
            let key = session_lock_key(&format!("unknown{index}"));
            drop(
                manager
                    .lock_shared_with_timeout(&key, Duration::from_millis(50))
                    .await
                    .expect("shared lock"),
            );
        }

        assert!(manager.len().await <= PRUNE_THRESHOLD);
        assert!(manager.try_lock_exclusive("held").await.is_none());
        drop(held);
    }

    #[test]
    fn path_keys_are_normalized() {
        let key = path_lock_key("a/b.txt");
        for alias in ["/a/b.txt", "\\a/b.txt", "a/./b.txt", "a//b.txt", "./a/b.txt", " a/b.txt "] {
            assert_eq!(path_lock_key(alias), key, "{alias:?}");
        }
        assert_ne!(path_lock_key("a/c.txt"), key);
    }
}
