//! 线程停止动作
//!
//! 节点关闭时仍在运行的任务，或运行在已失联节点上的任务，按任务的
//! `thread_stop_action` 处理。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskmgr_core::{Clock, TaskManagerResult};
use taskmgr_dispatcher::{ScheduleAnchor, TaskSynchronizer};
use taskmgr_domain::{
    ModifyGuard, OperationResult, OperationResultStatus, Task, TaskDelta, TaskExecutionStatus,
    TaskRepository, ThreadStopAction,
};
use tracing::{info, warn};

pub struct TaskRecovery {
    tasks: Arc<dyn TaskRepository>,
    synchronizer: Arc<TaskSynchronizer>,
    clock: Arc<dyn Clock>,
}

impl TaskRecovery {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        synchronizer: Arc<TaskSynchronizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            synchronizer,
            clock,
        }
    }

    /// 停止动作对应的目标状态和增量
    pub fn stop_action_deltas(
        action: ThreadStopAction,
        now: DateTime<Utc>,
        reason: &str,
    ) -> (TaskExecutionStatus, Vec<TaskDelta>) {
        let mut deltas = vec![
            TaskDelta::LastRunFinishTimestamp(Some(now)),
            TaskDelta::StalledSince(None),
        ];
        let status = match action {
            ThreadStopAction::Restart | ThreadStopAction::Reschedule => {
                TaskExecutionStatus::Runnable
            }
            ThreadStopAction::Close => {
                deltas.push(TaskDelta::CompletionTimestamp(Some(now)));
                deltas.push(TaskDelta::Result(Some(OperationResult::with_status(
                    OperationResultStatus::Warning,
                    reason,
                ))));
                TaskExecutionStatus::Closed
            }
            ThreadStopAction::Suspend => {
                deltas.push(TaskDelta::Result(Some(OperationResult::with_status(
                    OperationResultStatus::Warning,
                    reason,
                ))));
                TaskExecutionStatus::Suspended
            }
        };
        deltas.insert(0, TaskDelta::ExecutionStatus(status));
        (status, deltas)
    }

    /// 对仍处于 RUNNING 的任务执行停止动作；任务状态已被并发修改时返回 StateConflict
    pub async fn apply_thread_stop_action(
        &self,
        task: &Task,
        reason: &str,
    ) -> TaskManagerResult<Task> {
        let oid = task.oid.clone().unwrap_or_default();
        let now = self.clock.now();
        let action = task.thread_stop_action;
        let (_, deltas) = Self::stop_action_deltas(action, now, reason);

        let updated = self
            .tasks
            .modify(
                &oid,
                &deltas,
                Some(&ModifyGuard::status(TaskExecutionStatus::Running)),
            )
            .await?;
        info!(task_oid = %oid, action = ?action, reason, "已执行线程停止动作");

        self.after_stop(&updated, action, now).await;
        Ok(updated)
    }

    /// 停止动作写入后同步触发器，失败只记录日志
    pub async fn after_stop(&self, task: &Task, action: ThreadStopAction, now: DateTime<Utc>) {
        let oid = task.oid.as_deref().unwrap_or_default();
        let result = match action {
            ThreadStopAction::Restart => self.restart(task).await,
            ThreadStopAction::Reschedule if task.is_loose_bound() && task.is_recurring() => self
                .synchronizer
                .reschedule_task(task, ScheduleAnchor::AfterRun(now))
                .await
                .map(|_| ()),
            _ => self.synchronizer.synchronize_task(task).await.map(|_| ()),
        };

        if let Err(e) = result {
            warn!(task_oid = %oid, "停止动作后同步触发器失败: {}", e);
        }
    }

    async fn restart(&self, task: &Task) -> TaskManagerResult<()> {
        let Some(oid) = task.oid.as_deref() else {
            return Ok(());
        };
        self.synchronizer.synchronize_task(task).await?;

        // 新布置的主触发器已经到期时不再额外添加立即运行触发器
        let due = self
            .synchronizer
            .next_run_start_time(oid)
            .await?
            .is_some_and(|next| next <= self.clock.now());
        if !due {
            self.synchronizer.trigger_now(task).await?;
        }
        Ok(())
    }
}
