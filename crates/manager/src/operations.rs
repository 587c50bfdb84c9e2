//! 任务状态操作
//!
//! 每个操作都先在带状态守卫的条件下写入持久化状态，再同步触发器和运行中的任务。
//! 持久化之后的触发器操作失败只记录日志，任务状态以持久化记录为准。

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use chrono::Duration;
use taskmgr_core::{TaskManagerError, TaskManagerResult};
use taskmgr_dispatcher::{ScheduleAnchor, TaskSynchronizer};
use taskmgr_domain::{
    ModifyGuard, OperationResult, Task, TaskDelta, TaskEvent, TaskExecutionStatus, TaskQuery,
    WaitingReason,
};
use taskmgr_worker::WaitPolicy;
use tracing::{debug, info, warn};

use crate::outcome::{BatchFailure, BatchOutcome, CleanupOutcome, SuspendOutcome};
use crate::task_manager::TaskManager;

const SUSPENDABLE: [TaskExecutionStatus; 3] = [
    TaskExecutionStatus::Runnable,
    TaskExecutionStatus::Running,
    TaskExecutionStatus::Waiting,
];

impl TaskManager {
    // ---- 创建和修改 ----

    /// 持久化新任务并布置触发器，返回分配的oid
    pub async fn add_task(&self, mut task: Task) -> TaskManagerResult<String> {
        if matches!(
            task.execution_status,
            TaskExecutionStatus::Running | TaskExecutionStatus::Closed
        ) {
            return Err(TaskManagerError::SchemaViolation(format!(
                "新任务的执行状态不能是 {}",
                task.execution_status
            )));
        }
        task.validate()?;
        TaskSynchronizer::validate_schedule(&task)?;

        if task.created_at.is_none() {
            task.created_at = Some(self.clock.now());
        }
        task.node = None;
        task.stalled_since = None;

        let oid = self.tasks.add(task).await?;
        let stored = self.tasks.get(&oid).await?;
        self.synchronizer.synchronize_task(&stored).await?;
        info!(task_oid = %oid, name = %stored.name, status = %stored.execution_status, "任务已创建");
        Ok(oid)
    }

    /// 修改任务属性，涉及调度的修改会重新同步触发器
    ///
    /// 执行状态只能通过挂起、恢复等操作修改。
    pub async fn modify_task(&self, oid: &str, deltas: &[TaskDelta]) -> TaskManagerResult<Task> {
        if deltas
            .iter()
            .any(|delta| matches!(delta, TaskDelta::ExecutionStatus(_)))
        {
            return Err(TaskManagerError::SchemaViolation(
                "执行状态只能通过挂起、恢复、暂停等操作修改".to_string(),
            ));
        }

        let updated = self.tasks.modify(oid, deltas, None).await?;
        if deltas.iter().any(TaskDelta::touches_scheduling) {
            self.synchronizer.synchronize_task(&updated).await?;
            debug!(task_oid = oid, "调度设置已修改，触发器已同步");
        }
        Ok(updated)
    }

    // ---- 挂起 ----

    /// 挂起任务，返回按等待策略确认任务是否已在整个集群停止
    ///
    /// 已挂起的任务不再修改，但仍按策略等待其停止。
    pub async fn suspend_task(&self, oid: &str, policy: WaitPolicy) -> TaskManagerResult<bool> {
        self.persist_suspension(oid).await?;
        Ok(self.stop_runs(&[oid.to_string()], policy).await)
    }

    /// 批量挂起，单个任务失败不影响其他任务，最后统一等待
    pub async fn suspend_tasks(&self, oids: &[String], policy: WaitPolicy) -> SuspendOutcome {
        let mut batch = BatchOutcome::default();
        for oid in oids {
            batch.record(oid, self.persist_suspension(oid).await);
        }
        let stopped = self.stop_runs(&batch.succeeded, policy).await;
        SuspendOutcome { batch, stopped }
    }

    /// 挂起任务及其全部未关闭的后代任务
    pub async fn suspend_task_tree(
        &self,
        oid: &str,
        policy: WaitPolicy,
    ) -> TaskManagerResult<SuspendOutcome> {
        let root = self.tasks.get(oid).await?;
        let mut oids = Vec::new();
        if !root.is_closed() {
            oids.push(oid.to_string());
        }
        for subtask in self.list_subtasks(oid, true).await? {
            if subtask.is_closed() {
                continue;
            }
            if let Some(child) = subtask.oid {
                oids.push(child);
            }
        }
        info!(task_oid = oid, count = oids.len(), "挂起任务树");
        Ok(self.suspend_tasks(&oids, policy).await)
    }

    async fn persist_suspension(&self, oid: &str) -> TaskManagerResult<()> {
        let task = self.tasks.get(oid).await?;
        if task.execution_status == TaskExecutionStatus::Suspended {
            debug!(task_oid = oid, "任务已处于挂起状态");
            return Ok(());
        }
        task.next_status(TaskEvent::Suspend)?;

        let updated = self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Suspended),
                    TaskDelta::WaitingReason(None),
                ],
                Some(&ModifyGuard::status_in(&SUSPENDABLE)),
            )
            .await?;
        self.metrics.record_task_suspended();
        info!(task_oid = oid, previous = %task.execution_status, "任务已挂起");

        if let Err(e) = self.synchronizer.synchronize_task(&updated).await {
            warn!(task_oid = oid, "挂起后移除触发器失败: {}", e);
        }
        Ok(())
    }

    /// 暂停触发器并通知运行中的节点，查询集群状态失败时视为未确认停止
    async fn stop_runs(&self, oids: &[String], policy: WaitPolicy) -> bool {
        if oids.is_empty() {
            return true;
        }
        match self.execution.stop_task_runs(oids, policy).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!(tasks = ?oids, "停止任务运行失败: {}", e);
                false
            }
        }
    }

    // ---- 恢复 ----

    /// 恢复挂起的任务或已关闭的循环任务；已是 RUNNABLE 的任务不做任何修改
    pub async fn resume_task(&self, oid: &str) -> TaskManagerResult<()> {
        let task = self.tasks.get(oid).await?;
        if task.execution_status == TaskExecutionStatus::Runnable {
            debug!(task_oid = oid, "任务已处于RUNNABLE状态");
            return Ok(());
        }
        task.next_status(TaskEvent::Resume)?;
        TaskSynchronizer::validate_schedule(&task)?;

        let mut deltas = vec![
            TaskDelta::ExecutionStatus(TaskExecutionStatus::Runnable),
            TaskDelta::Result(Some(OperationResult::in_progress())),
            TaskDelta::WaitingReason(None),
            TaskDelta::StalledSince(None),
        ];
        if task.is_closed() {
            deltas.push(TaskDelta::CompletionTimestamp(None));
        }
        let updated = self
            .tasks
            .modify(
                oid,
                &deltas,
                Some(&ModifyGuard::status(task.execution_status)),
            )
            .await?;
        info!(task_oid = oid, previous = %task.execution_status, "任务已恢复");

        if let Err(e) = self
            .synchronizer
            .reschedule_task(&updated, ScheduleAnchor::Resumed(self.clock.now()))
            .await
        {
            warn!(task_oid = oid, "恢复后布置触发器失败: {}", e);
        }
        Ok(())
    }

    pub async fn resume_tasks(&self, oids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for oid in oids {
            outcome.record(oid, self.resume_task(oid).await);
        }
        outcome
    }

    // ---- 等待依赖 ----

    /// RUNNABLE 任务进入等待，触发器保留但暂停
    pub async fn pause_task(&self, oid: &str, reason: WaitingReason) -> TaskManagerResult<()> {
        let task = self.tasks.get(oid).await?;
        task.next_status(TaskEvent::Pause)?;

        let updated = self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Waiting),
                    TaskDelta::WaitingReason(Some(reason)),
                ],
                Some(&ModifyGuard::status(TaskExecutionStatus::Runnable)),
            )
            .await?;
        debug!(task_oid = oid, reason = ?updated.waiting_reason, "任务进入等待");

        if let Err(e) = self.synchronizer.synchronize_task(&updated).await {
            warn!(task_oid = oid, "暂停触发器失败: {}", e);
        }
        Ok(())
    }

    pub async fn pause_tasks(&self, oids: &[String], reason: WaitingReason) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for oid in oids {
            outcome.record(oid, self.pause_task(oid, reason.clone()).await);
        }
        outcome
    }

    /// 结束等待；操作结果属于等待前的那次运行，保持不变
    pub async fn unpause_task(&self, oid: &str) -> TaskManagerResult<()> {
        let task = self.tasks.get(oid).await?;
        task.next_status(TaskEvent::Unpause)?;

        let updated = self
            .tasks
            .modify(
                oid,
                &[
                    TaskDelta::ExecutionStatus(TaskExecutionStatus::Runnable),
                    TaskDelta::WaitingReason(None),
                ],
                Some(&ModifyGuard::status(TaskExecutionStatus::Waiting)),
            )
            .await?;
        debug!(task_oid = oid, "任务结束等待");

        if let Err(e) = self.synchronizer.synchronize_task(&updated).await {
            warn!(task_oid = oid, "恢复触发器失败: {}", e);
        }
        Ok(())
    }

    pub async fn unpause_tasks(&self, oids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for oid in oids {
            outcome.record(oid, self.unpause_task(oid).await);
        }
        outcome
    }

    // ---- 立即运行 ----

    /// 清除旧的操作结果后立即运行任务；已关闭的循环任务会重新激活
    pub async fn schedule_task_now(&self, oid: &str) -> TaskManagerResult<()> {
        let task = self.tasks.get(oid).await?;
        task.next_status(TaskEvent::ScheduleNow)?;

        let mut deltas = vec![
            TaskDelta::ExecutionStatus(TaskExecutionStatus::Runnable),
            TaskDelta::Result(Some(OperationResult::in_progress())),
        ];
        if task.is_closed() {
            deltas.push(TaskDelta::CompletionTimestamp(None));
        }
        let updated = self
            .tasks
            .modify(
                oid,
                &deltas,
                Some(&ModifyGuard::status(task.execution_status)),
            )
            .await?;

        self.execution.schedule_task_now(&updated).await?;
        info!(task_oid = oid, "任务已安排立即运行");
        Ok(())
    }

    pub async fn schedule_tasks_now(&self, oids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for oid in oids {
            outcome.record(oid, self.schedule_task_now(oid).await);
        }
        outcome
    }

    // ---- 删除 ----

    /// 删除任务记录并移除其作业；本节点上仍在运行的实例会收到停止请求
    pub async fn delete_task(&self, oid: &str) -> TaskManagerResult<()> {
        self.tasks.delete(oid).await?;
        self.execution.stop_local_task(oid);
        if let Err(e) = self.synchronizer.remove_task(oid).await {
            warn!(task_oid = oid, "删除任务作业失败: {}", e);
        }
        info!(task_oid = oid, "任务已删除");
        Ok(())
    }

    /// 先挂起并在限定时间内等待停止，再删除；无论是否按时停止都会删除
    pub async fn suspend_and_delete_tasks(&self, oids: &[String], wait: StdDuration) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut missing = HashSet::new();
        let mut to_suspend = Vec::new();

        for oid in oids {
            match self.tasks.get(oid).await {
                Ok(task) => {
                    if !task.is_closed() && task.execution_status != TaskExecutionStatus::Suspended
                    {
                        to_suspend.push(oid.clone());
                    }
                }
                Err(e) => {
                    missing.insert(oid.clone());
                    outcome.record(oid, Err(e));
                }
            }
        }

        let suspended = self
            .suspend_tasks(&to_suspend, WaitPolicy::WaitFor(wait))
            .await;
        for failure in &suspended.batch.failed {
            warn!(task_oid = %failure.oid, "删除前挂起任务失败: {}", failure.error);
        }
        if !suspended.stopped {
            info!("部分任务未在等待时间内停止，仍然删除");
        }

        for oid in oids.iter().filter(|oid| !missing.contains(*oid)) {
            outcome.record(oid, self.delete_task(oid).await);
        }
        outcome
    }

    pub async fn suspend_and_delete_task(&self, oid: &str, wait: StdDuration) -> TaskManagerResult<()> {
        let mut outcome = self
            .suspend_and_delete_tasks(&[oid.to_string()], wait)
            .await;
        match outcome.failed.pop() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    // ---- 清理 ----

    /// 删除完成时间早于 `max_age` 之前的已关闭根任务及其整棵子任务树
    ///
    /// 单棵树删除失败记录后继续处理其余的树。
    pub async fn cleanup_tasks(&self, max_age: Duration) -> TaskManagerResult<CleanupOutcome> {
        let cutoff = self.clock.now() - max_age;
        let roots = self
            .tasks
            .search(
                &TaskQuery::all()
                    .roots()
                    .with_statuses(&[TaskExecutionStatus::Closed])
                    .completed_before(cutoff),
            )
            .await?;
        info!(count = roots.len(), cutoff = %cutoff, "开始清理已关闭的任务树");

        let mut outcome = CleanupOutcome::default();
        for root in roots {
            let Some(root_oid) = root.oid else {
                continue;
            };
            match self.delete_task_tree(&root_oid, &mut outcome.deleted_tasks).await {
                Ok(true) => outcome.deleted_trees += 1,
                Ok(false) => outcome.skipped_trees += 1,
                Err(error) => {
                    warn!(task_oid = %root_oid, "删除任务树失败: {}", error);
                    outcome.failed.push(BatchFailure {
                        oid: root_oid,
                        error,
                    });
                }
            }
        }

        info!(
            deleted_trees = outcome.deleted_trees,
            deleted_tasks = outcome.deleted_tasks,
            skipped_trees = outcome.skipped_trees,
            failed = outcome.failed.len(),
            "任务清理完成"
        );
        Ok(outcome)
    }

    /// 由叶到根删除任务树；树中还有未关闭的子任务时不删除并返回 false
    async fn delete_task_tree(&self, root_oid: &str, deleted: &mut usize) -> TaskManagerResult<bool> {
        let subtasks = self.list_subtasks(root_oid, true).await?;
        if let Some(open) = subtasks.iter().find(|t| !t.is_closed()) {
            debug!(task_oid = root_oid, subtask = %open.display_id(), "任务树中有未关闭的子任务，跳过");
            return Ok(false);
        }

        let oids = subtasks
            .iter()
            .rev()
            .filter_map(|t| t.oid.as_deref())
            .chain(std::iter::once(root_oid));
        for oid in oids {
            match self.delete_task(oid).await {
                Ok(()) => *deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
