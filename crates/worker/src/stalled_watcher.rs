//! 停滞任务检测
//!
//! 周期性检查本节点正在运行的任务，长时间没有进度更新的任务被标记停滞时间。
//! 只记录事实，不停止或挂起任务。

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use taskmgr_core::{Clock, TaskManagerResult};
use taskmgr_domain::{ModifyGuard, TaskDelta, TaskExecutionStatus, TaskRepository};
use taskmgr_infrastructure::MetricsCollector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::running_task::{LocalRunningTasks, RunningTask};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StalledScanReport {
    pub scanned: usize,
    /// 本次新标记为停滞的任务
    pub newly_stalled: Vec<String>,
    /// 恢复进度、清除了停滞标记的任务
    pub recovered: Vec<String>,
    pub failed: usize,
}

pub struct StalledTaskWatcher {
    tasks: Arc<dyn TaskRepository>,
    running: Arc<LocalRunningTasks>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    metrics: MetricsCollector,
}

impl StalledTaskWatcher {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        running: Arc<LocalRunningTasks>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
    ) -> Self {
        Self {
            tasks,
            running,
            clock,
            threshold,
            metrics: MetricsCollector::new(),
        }
    }

    /// 检查一次全部本地运行中的任务
    pub async fn scan(&self) -> StalledScanReport {
        let now = self.clock.now();
        let mut report = StalledScanReport::default();

        for task in self.running.list() {
            report.scanned += 1;
            let last_progress = task.last_progress_at();
            let stale = now - last_progress > self.threshold;

            // 同一次停滞只记录一次
            let target = match (stale, task.stalled_since()) {
                (true, None) => Some(Some(last_progress)),
                (false, Some(_)) => Some(None),
                _ => None,
            };
            let Some(since) = target else {
                continue;
            };

            match self.mark(&task, since).await {
                Ok(true) if since.is_some() => report.newly_stalled.push(task.display_id()),
                Ok(true) => report.recovered.push(task.display_id()),
                Ok(false) => {}
                Err(e) => {
                    warn!(task = %task.display_id(), "更新任务停滞状态失败: {}", e);
                    report.failed += 1;
                }
            }
        }

        if !report.newly_stalled.is_empty() {
            info!(tasks = ?report.newly_stalled, "检测到停滞任务");
        }
        debug!(
            scanned = report.scanned,
            stalled = report.newly_stalled.len(),
            recovered = report.recovered.len(),
            "停滞任务检查完成"
        );
        report
    }

    /// 写入停滞时间，返回是否实际更新
    async fn mark(
        &self,
        task: &RunningTask,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> TaskManagerResult<bool> {
        if let Some(oid) = task.oid() {
            match self
                .tasks
                .modify(
                    oid,
                    &[TaskDelta::StalledSince(since)],
                    Some(&ModifyGuard::status(TaskExecutionStatus::Running)),
                )
                .await
            {
                Ok(_) => {}
                // 任务已不在运行，交给执行器收尾
                Err(e) if e.is_state_conflict() || e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        task.set_stalled_since(since);
        if since.is_some() {
            self.metrics.record_stalled_task();
            warn!(task = %task.display_id(), since = ?since, "任务长时间没有进度");
        }
        Ok(true)
    }

    /// 启动周期检查
    pub fn spawn(self: Arc<Self>, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.scan().await;
                    }
                    _ = cancel.cancelled() => {
                        debug!("停滞任务检查已停止");
                        break;
                    }
                }
            }
        })
    }
}
