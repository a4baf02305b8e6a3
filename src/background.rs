//! 后台任务调度：定时清理临时目录，支持运行时重新注册。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::reaper::Reaper;

/// 持有唯一的清理任务句柄；重新注册时先取消旧任务。
#[derive(Debug, Default)]
pub struct Scheduler {
    reaper_job: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            reaper_job: Mutex::new(None),
        }
    }

    /// 注册清理任务，首次执行在一个周期之后；周期为 0 时只取消旧任务。
    pub async fn schedule_reaper(&self, reaper: Arc<Reaper>, period: Duration) {
        let mut job = self.reaper_job.lock().await;
        if let Some(previous) = job.take() {
            previous.abort();
        }
        if period.is_zero() {
            info!("reaper disabled");
            return;
        }

        *job = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                reaper.run().await;
            }
        }));
        info!(interval_secs = period.as_secs_f64(), "reaper scheduled");
    }

    pub async fn cancel_reaper(&self) {
        if let Some(previous) = self.reaper_job.lock().await.take() {
            previous.abort();
        }
    }

    pub async fn is_reaper_active(&self) -> bool {
        self.reaper_job
            .lock()
            .await
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }
}

/// 收到 SIGHUP 时重新读取配置并按新周期重新注册清理任务。
#[cfg(unix)]
pub fn spawn_reload_on_hangup(
    config_path: PathBuf,
    scheduler: Arc<Scheduler>,
    reaper: Arc<Reaper>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                warn!(error = %err, "failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match crate::config::AppConfig::load(&config_path) {
                Ok(config) => {
                    info!(path = ?config_path, "config reloaded");
                    scheduler
                        .schedule_reaper(reaper.clone(), config.clean_interval())
                        .await;
                }
                Err(err) => warn!(path = ?config_path, error = %err, "config reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_hangup(
    _config_path: PathBuf,
    _scheduler: Arc<Scheduler>,
    _reaper: Arc<Reaper>,
) {
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockManager;
    use crate::reaper::ReaperConfig;
    use tempfile::tempdir;

    fn make_reaper(temp_root: PathBuf) -> Arc<Reaper> {
        Arc::new(Reaper::new(
            temp_root,
            Arc::new(LockManager::new()),
            ReaperConfig {
                temp_retention: Duration::ZERO,
                multipart_expire: Duration::ZERO,
            },
        ))
    }

    async fn wait_until_removed(path: &std::path::Path) -> bool {
        for _ in 0..100 {
            if !path.exists() {
                return true;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn rescheduling_replaces_previous_job() {
        let temp = tempdir().expect("tempdir");
        let stale = temp.path().join("stale.tmp");
        std::fs::write(&stale, b"x").expect("write temp file");
        let reaper = make_reaper(temp.path().to_path_buf());
        let scheduler = Scheduler::new();

        scheduler
            .schedule_reaper(reaper.clone(), Duration::from_secs(3600))
            .await;
        assert!(scheduler.is_reaper_active().await);
        time::sleep(Duration::from_millis(50)).await;
        assert!(stale.exists(), "first run waits one full interval");

        scheduler
            .schedule_reaper(reaper, Duration::from_millis(20))
            .await;
        assert!(scheduler.is_reaper_active().await);
        assert!(wait_until_removed(&stale).await, "rescheduled job should run");

        scheduler.cancel_reaper().await;
        assert!(!scheduler.is_reaper_active().await);
    }

    #[tokio::test]
    async fn zero_interval_disables_reaper() {
        let temp = tempdir().expect("tempdir");
        let reaper = make_reaper(temp.path().to_path_buf());
        let scheduler = Scheduler::new();

        scheduler
            .schedule_reaper(reaper.clone(), Duration::from_millis(20))
            .await;
        assert!(scheduler.is_reaper_active().await);
        scheduler.schedule_reaper(reaper, Duration::ZERO).await;
        assert!(!scheduler.is_reaper_active().await);
    }
}
